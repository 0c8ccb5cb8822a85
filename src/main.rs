//! Thin command-line surface over the kernel.
//!
//! ```text
//! obdmon connect
//! obdmon list-sensors
//! obdmon poll <pid>... [seconds]
//! obdmon dtc
//! obdmon reset-dtc
//! obdmon rule add <expression>
//! obdmon rule list
//! obdmon rule rm <expression>
//! ```
//!
//! The serial port comes from `OBDMON_PORT` (default `/dev/ttyUSB0`),
//! the rule file from `OBDMON_RULES` (default `rules.txt`), and the DTC
//! dictionary from `OBDMON_CODES` (loaded when the file exists).

use std::{env, path::PathBuf, process::ExitCode, thread, time::Duration};

use obdmon::dtc::DtcDictionary;
use obdmon::rule::{self, Rule};
use obdmon::sim::SimulatedVehicle;
use obdmon::{Kernel, KernelError, Pid, RuleError};

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// 1 for session problems, 2 for protocol problems, 3 for rule parse
/// problems.
fn exit_code(error: &KernelError) -> u8 {
    match error {
        KernelError::Decode(_) => 2,
        KernelError::Rule(RuleError::ParseFailed(_)) => 3,
        KernelError::Session(obdmon::SessionError::Decode(_)) => 2,
        _ => 1,
    }
}

fn run(args: &[String]) -> Result<(), KernelError> {
    let Some(command) = args.first() else {
        usage();
        return Ok(());
    };

    match command.as_str() {
        "connect" => connect_and_report(),
        "list-sensors" => list_sensors(),
        "poll" => poll(&args[1..]),
        "dtc" => show_dtcs(),
        "reset-dtc" => reset_dtcs(),
        "rule" => rule_command(&args[1..]),
        _ => {
            usage();
            Ok(())
        }
    }
}

fn usage() {
    eprintln!(
        "usage: obdmon <connect | list-sensors | poll <pid>... [seconds] | dtc | reset-dtc | rule add|list|rm>"
    );
}

fn port() -> String {
    env::var("OBDMON_PORT").unwrap_or_else(|_| "/dev/ttyUSB0".to_owned())
}

fn rule_file() -> PathBuf {
    PathBuf::from(env::var("OBDMON_RULES").unwrap_or_else(|_| "rules.txt".to_owned()))
}

fn dictionary() -> DtcDictionary {
    let path = PathBuf::from(env::var("OBDMON_CODES").unwrap_or_else(|_| "codes.txt".to_owned()));
    if path.exists() {
        DtcDictionary::load(&path).unwrap_or_else(|e| {
            eprintln!("warning: could not read {}: {e}", path.display());
            DtcDictionary::new()
        })
    } else {
        DtcDictionary::new()
    }
}

/// `OBDMON_PORT=sim` runs against the built-in simulated vehicle.
fn open_kernel() -> Result<Kernel, KernelError> {
    let mut kernel = Kernel::with_dictionary(dictionary());
    let port = port();
    if port == "sim" {
        kernel.set_init_grace(Duration::from_millis(10));
        kernel.connect(Box::new(SimulatedVehicle::new()))?;
        return Ok(kernel);
    }
    connect_port(&mut kernel, &port)?;
    Ok(kernel)
}

#[cfg(feature = "serialport_comm")]
fn connect_port(kernel: &mut Kernel, port: &str) -> Result<(), KernelError> {
    kernel.connect_port(port)
}

#[cfg(not(feature = "serialport_comm"))]
fn connect_port(_kernel: &mut Kernel, _port: &str) -> Result<(), KernelError> {
    Err(KernelError::NotConnected)
}

fn connect_and_report() -> Result<(), KernelError> {
    let mut kernel = open_kernel()?;

    println!("adapter:  {}", kernel.adapter_version()?);
    println!("protocol: {}", kernel.protocol()?);
    println!("standard: {}", kernel.standard()?);
    println!("voltage:  {}", kernel.voltage()?);
    match kernel.vin() {
        Ok(vin) => println!("VIN:      {vin}"),
        Err(e) => println!("VIN:      unavailable ({e})"),
    }
    println!(
        "MIL:      {}, {} stored code(s)",
        if kernel.mil_on()? { "on" } else { "off" },
        kernel.dtc_count()?
    );

    kernel.disconnect();
    Ok(())
}

fn list_sensors() -> Result<(), KernelError> {
    let mut kernel = open_kernel()?;

    for sensor in kernel.sensors()? {
        println!(
            "{}  {:<28} [{}]  {}",
            sensor.pid,
            sensor.name,
            sensor.unit,
            if sensor.supported {
                "supported"
            } else {
                "not supported"
            }
        );
    }

    kernel.disconnect();
    Ok(())
}

fn poll(args: &[String]) -> Result<(), KernelError> {
    let mut pids = Vec::new();
    let mut seconds = 10u64;
    for arg in args {
        match Pid::parse(arg) {
            Some(pid) => pids.push(pid),
            None => match arg.parse::<u64>() {
                Ok(n) => seconds = n,
                Err(_) => return Err(KernelError::UnknownPid(arg.clone())),
            },
        }
    }
    if pids.is_empty() {
        usage();
        return Ok(());
    }

    let mut kernel = open_kernel()?;

    for pid in &pids {
        kernel.activate(*pid)?;
        let snapshot = kernel.sensor(*pid)?;
        kernel.subscribe_value(
            *pid,
            Box::new(move |pid, value| {
                println!("{pid}  {value:.1} {}", snapshot.unit);
            }),
        );
    }
    kernel.subscribe_error(Box::new(|message| eprintln!("! {message}")));
    kernel.subscribe_rule(Box::new(|name| println!("rule satisfied: {name}")));

    // pick up saved rules that apply to the sensors being polled
    let rules = rule_file();
    if rules.exists() {
        kernel.load_rules(&rules)?;
    }

    kernel.start_polling()?;
    thread::sleep(Duration::from_secs(seconds));
    kernel.stop_polling()?;
    kernel.disconnect();
    Ok(())
}

fn show_dtcs() -> Result<(), KernelError> {
    let mut kernel = open_kernel()?;

    let codes = kernel.dtcs()?;
    println!(
        "MIL {}, {} stored code(s)",
        if kernel.mil_on()? { "on" } else { "off" },
        codes.len()
    );
    for dtc in codes {
        match &dtc.solution {
            Some(solution) => println!("{}  {} ({solution})", dtc.code, dtc.meaning),
            None => println!("{}  {}", dtc.code, dtc.meaning),
        }
    }

    kernel.disconnect();
    Ok(())
}

fn reset_dtcs() -> Result<(), KernelError> {
    let mut kernel = open_kernel()?;

    if kernel.reset_codes()? {
        println!("stored codes cleared, MIL reset");
    } else {
        println!("nothing to clear");
    }

    kernel.disconnect();
    Ok(())
}

/// Rule file maintenance works offline; nothing here touches the
/// adapter.
fn rule_command(args: &[String]) -> Result<(), KernelError> {
    let path = rule_file();
    let mut sources = if path.exists() {
        rule::load_rule_file(&path)?
    } else {
        Vec::new()
    };

    match args.first().map(String::as_str) {
        Some("add") => {
            let expression = args[1..].join(" ");
            // validate against the grammar before persisting
            Rule::parse(expression.clone(), expression.clone())?;
            if !sources.contains(&expression) {
                sources.push(expression);
                rule::save_rule_file(&path, &sources)?;
            }
            Ok(())
        }
        Some("list") => {
            for source in sources {
                println!("{source}");
            }
            Ok(())
        }
        Some("rm") => {
            let expression = args[1..].join(" ");
            let before = sources.len();
            sources.retain(|s| *s != expression);
            if sources.len() == before {
                return Err(KernelError::RuleNotActive(expression));
            }
            rule::save_rule_file(&path, &sources)?;
            Ok(())
        }
        _ => {
            usage();
            Ok(())
        }
    }
}
