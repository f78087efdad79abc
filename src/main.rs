use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;

use structopt::StructOpt;

use apex_ooo_sim::cpu::{CPU, CPUConfig, load_cpu_config, RunOutcome, SimError};
use apex_ooo_sim::loader::loader::load;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Command {
    Simulate,
    Display,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulate" => Ok(Command::Simulate),
            "display" => Ok(Command::Display),
            _ => Err(format!("unknown command '{}', expected simulate or display", s)),
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "APEX out-of-order simulator")]
struct Opt {
    /// Path of the file to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// simulate, or display to print every pipeline stage each cycle
    #[structopt(long, default_value = "simulate")]
    command: Command,

    /// Overrides the cycle budget of the config
    #[structopt(long)]
    cycles: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let mut cpu_config = match &opt.config {
        Some(config_path) => match load_cpu_config(config_path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("Failed to load {}. Cause: {}", config_path.display(), error);
                exit(1);
            }
        },
        None => CPUConfig::default(),
    };

    if let Some(cycles) = opt.cycles {
        cpu_config.cycle_budget = cycles;
    }

    let path = opt.file.to_string_lossy().to_string();
    println!("Loading {}", path);
    let program = match load(&path) {
        Ok(program) => program,
        Err(error) => {
            eprintln!("Loading program '{}' failed. Cause: {}", path, error);
            exit(1);
        }
    };

    let mut cpu = CPU::new(&cpu_config, program);
    let result = match opt.command {
        Command::Simulate => cpu.run(),
        Command::Display => run_display(&mut cpu, cpu_config.cycle_budget),
    };

    match result {
        Ok(outcome) => {
            if outcome.completed {
                println!("Program complete after {} cycles", outcome.cycles);
            } else {
                println!("Cycle budget exhausted after {} cycles", outcome.cycles);
            }
            print_state(&cpu);
        }
        Err(error) => {
            eprintln!("Simulation failed: {}", error);
            print_state(&cpu);
            exit(2);
        }
    }
}

fn run_display(cpu: &mut CPU, cycle_budget: u64) -> Result<RunOutcome, SimError> {
    while !cpu.is_complete() && cpu.perf_counters().cycle_cnt < cycle_budget {
        cpu.step()?;

        println!("--------------------------------");
        println!("Clock Cycle #: {}", cpu.perf_counters().cycle_cnt);
        println!("--------------------------------");
        for stage in cpu.snapshot() {
            println!("{}", stage);
        }
    }

    Ok(RunOutcome { completed: cpu.is_complete(), cycles: cpu.perf_counters().cycle_cnt })
}

fn print_state(cpu: &CPU) {
    let state = cpu.architectural_state();

    println!("=============== STATE OF ARCHITECTURAL REGISTER FILE ==========");
    for (reg, value) in state.registers.iter().enumerate() {
        println!("|\tREG[{}]\t|\tValue = {}\t|", reg, value);
    }
    println!("|\tZ\t|\tValue = {}\t|", state.zero_flag as u8);

    println!("============== STATE OF DATA MEMORY =============");
    for (address, value) in state.memory.iter().enumerate().filter(|(_, value)| **value != 0) {
        println!("|\tMEM[{}]\t|\tData Value = {}\t|", address, value);
    }

    println!("============== PERFORMANCE COUNTERS =============");
    println!("{}", cpu.perf_counters());
}
