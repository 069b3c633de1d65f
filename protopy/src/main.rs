use clap::Parser as ClapParser;
use std::{path::PathBuf, process, sync::Arc};

use log::info;
use protopy::{Job, Scheduler, VM, VMCreateInfo, VmError, assemble_file};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Assembled module to run as `__main__`
    #[arg(help = "The .pyasm file to execute")]
    file: PathBuf,

    #[arg(long, help = "Maximum depth of nested calls")]
    recursion_limit: Option<usize>,

    #[arg(long, help = "Tracked allocations between automatic collections")]
    gc_threshold: Option<usize>,

    #[arg(long, help = "Append collector events to this file")]
    gc_trace: Option<PathBuf>,

    /// Runs the main module on a pool of worker threads.
    #[arg(long, help = "Number of scheduler workers")]
    workers: Option<usize>,

    #[arg(long, help = "Print the disassembly instead of executing")]
    dump: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match assemble_file(&cli.file) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error loading {}: {}", cli.file.display(), err);
            process::exit(1);
        }
    };

    if cli.dump {
        print!("{code}");
        return;
    }

    let mut info = VMCreateInfo::from_env();
    if let Some(limit) = cli.recursion_limit {
        info.recursion_limit = Some(limit);
    }
    if let Some(threshold) = cli.gc_threshold {
        info.heap.gc_threshold = Some(threshold);
    }
    if let Some(path) = cli.gc_trace {
        info.heap.trace_path = Some(path);
    }

    let vm = VM::new(info);
    let result = match cli.workers {
        Some(workers) => run_scheduled(&vm, code, workers),
        None => vm.run_main(code).map(|_| ()),
    };

    if let Err(err) = result {
        match err {
            VmError::Uncaught(report) => eprint!("{report}"),
            other => eprintln!("Error executing {}: {}", cli.file.display(), other),
        }
        process::exit(1);
    }
}

fn run_scheduled(
    vm: &VM,
    code: Arc<protopy::CodeObject>,
    workers: usize,
) -> Result<(), VmError> {
    let scheduler = Scheduler::new(vm.shared(), workers.max(1))?;
    info!("running __main__ on {} workers", scheduler.worker_count());
    let handle = scheduler.submit(Job::Module {
        name: Arc::from("__main__"),
        code,
    });
    let result = handle.wait();
    scheduler.shutdown()?;
    vm.join_threads()?;
    result?;
    Ok(())
}
