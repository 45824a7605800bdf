// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{cell::RefCell, io::Write, fs::File, rc::Rc, time::Instant};
use clap::{Command, Arg, ArgAction, ArgMatches, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use indicatif::{ProgressBar, ProgressStyle};
use anyhow::bail;

use jtagdap::probe::{Probe, ProbeInfo};
use jtagdap::dap::DAP;
use xtdap::{
    ChainConfig, ChainDevice, ChainInfo, JTAG, Ocd, OcdState, PollConfig, Width,
    chain, program::{self, Program, PROGRAMS},
    protocol::{DebugRegisterProtocol, Direct, Routed, routed},
};

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let address_arg = Arg::new("address")
        .help("Target address (decimal, or hex with 0x prefix)")
        .required(true)
        .value_parser(maybe_hex::<u32>);
    let width_arg = Arg::new("width")
        .help("Access width in bits")
        .long("width")
        .short('w')
        .action(ArgAction::Set)
        .default_value("32")
        .value_parser(["8", "16", "32"]);

    let matches = Command::new("xtdap")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("probe")
             .help("VID:PID[:SN] of CMSIS-DAP device to use")
             .long("probe")
             .short('p')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("freq")
             .help("JTAG clock frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .default_value("1M")
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("device")
             .help("Xtensa core's position in scan chain (0-indexed, see `scan` output)")
             .long("device")
             .short('d')
             .action(ArgAction::Set)
             .default_value("0")
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("ir-lengths")
             .help("Lengths of each IR, starting from device 0, comma-separated. \
                   Defaults to 5 bits for every device found.")
             .long("ir-lengths")
             .short('i')
             .action(ArgAction::Set)
             .value_delimiter(',')
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("idcode")
             .help("Expected IDCODE of the Xtensa core (decimal, or hex with 0x prefix)")
             .long("idcode")
             .action(ArgAction::Set)
             .default_value("0x120034E5")
             .value_parser(maybe_hex::<u32>)
             .global(true))
        .arg(Arg::new("variant")
             .help("Debug register interface of the core")
             .long("variant")
             .action(ArgAction::Set)
             .default_value("routed")
             .value_parser(["direct", "routed"])
             .global(true))
        .arg(Arg::new("max-devices")
             .help("Maximum number of devices expected on the scan chain")
             .long("max-devices")
             .action(ArgAction::Set)
             .default_value("4")
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("max-ir-length")
             .help("Maximum IR length of any device on the scan chain")
             .long("max-ir-length")
             .action(ArgAction::Set)
             .default_value("8")
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("poll-limit")
             .help("Maximum number of status polls before giving up on the target")
             .long("poll-limit")
             .action(ArgAction::Set)
             .default_value("1000")
             .value_parser(value_parser!(usize))
             .global(true))
        .subcommand(Command::new("probes")
            .about("List available CMSIS-DAP probes"))
        .subcommand(Command::new("programs")
            .about("List built-in instruction programs"))
        .subcommand(Command::new("scan")
            .about("Scan JTAG chain and print device IDCODEs"))
        .subcommand(Command::new("info")
            .about("Print information about the debug module"))
        .subcommand(Command::new("status")
            .about("Print debug status flags"))
        .subcommand(Command::new("halt")
            .about("Halt the core"))
        .subcommand(Command::new("run")
            .about("Resume the core, leaving OCD enabled"))
        .subcommand(Command::new("release")
            .about("Resume the core and disable OCD"))
        .subcommand(Command::new("regs")
            .about("Print address registers a0 to a15"))
        .subcommand(Command::new("reg")
            .about("Read or write a debug register by name")
            .arg(Arg::new("name")
                 .help("Debug register name, or `list` to list all registers")
                 .required(true))
            .arg(Arg::new("value")
                 .help("Value to write (decimal, or hex with 0x prefix)")
                 .value_parser(maybe_hex::<u32>)))
        .subcommand(Command::new("read")
            .about("Read a value from target memory")
            .arg(address_arg.clone())
            .arg(width_arg.clone()))
        .subcommand(Command::new("write")
            .about("Write a value to target memory")
            .arg(address_arg.clone())
            .arg(Arg::new("value")
                 .help("Value to write (decimal, or hex with 0x prefix)")
                 .required(true)
                 .value_parser(maybe_hex::<u32>))
            .arg(width_arg))
        .subcommand(Command::new("dump")
            .about("Read a block of target memory")
            .arg(address_arg)
            .arg(Arg::new("length")
                 .help("Length in bytes, a multiple of 4 (decimal, or hex with 0x prefix)")
                 .required(true)
                 .value_parser(maybe_hex::<usize>))
            .arg(Arg::new("file")
                 .help("File to write memory contents to, instead of printing them")
                 .long("file")
                 .short('o')
                 .action(ArgAction::Set)))
        .subcommand(Command::new("exec")
            .about("Run a built-in instruction program on the halted core")
            .arg(Arg::new("program")
                 .help("Program name, see `programs`")
                 .required(true))
            .arg(Arg::new("inputs")
                 .help("Values written to DDR for the program (decimal, or hex with 0x prefix)")
                 .action(ArgAction::Append)
                 .num_args(1..)
                 .value_parser(maybe_hex::<u32>)))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Listing probes and programs does not require connecting to a probe.
    match matches.subcommand_name() {
        Some("probes") => {
            print_probe_list();
            return Ok(());
        },
        Some("programs") => {
            print_program_list();
            return Ok(());
        },
        _ => (),
    }

    // All commands after this point require an open probe.
    let probe = if let Some(probe) = matches.get_one::<String>("probe") {
        ProbeInfo::from_specifier(probe)?.open()?
    } else {
        Probe::new()?
    };

    let dap = DAP::new(probe)?;
    let jtag = JTAG::new(dap);

    if let Some(&freq) = matches.get_one::<u32>("freq") {
        jtag.set_clock(freq)?;
    }
    let mut jtag = xtdap::jtag::open(jtag)?;

    let config = ChainConfig {
        max_devices: *matches.get_one("max-devices").unwrap_or(&4),
        max_ir_length: *matches.get_one("max-ir-length").unwrap_or(&8),
    };

    if matches.subcommand_name() == Some("scan") {
        let info = chain::scan(&mut jtag, &config)?;
        print_chain(&info);
        return Ok(());
    }

    // Without explicit IR lengths, assume every device is an Xtensa TAP.
    let ir_lengths = match matches.get_many::<usize>("ir-lengths") {
        Some(lens) => lens.copied().collect::<Vec<usize>>(),
        None => {
            let layout = chain::discover(&mut jtag, &config)?;
            vec![routed::IR_LENGTH; layout.devices]
        },
    };
    let index = *matches.get_one::<usize>("device").unwrap_or(&0);
    if index >= ir_lengths.len() {
        bail!("Device {} is not on a scan chain of {} devices.", index, ir_lengths.len());
    }
    let idcode = *matches.get_one::<u32>("idcode").unwrap_or(&routed::ESP32_IDCODE);
    let device = ChainDevice::new(Rc::new(RefCell::new(jtag)), index, &ir_lengths, idcode,
                                  &config)?;
    if !quiet { println!("Opened {}", device) };

    let poll = PollConfig {
        max_polls: *matches.get_one("poll-limit").unwrap_or(&1000),
        ..Default::default()
    };

    match matches.get_one::<String>("variant").map(|v| v.as_str()) {
        Some("direct") => run(Direct::new(device), poll, &matches, quiet)?,
        _ => run(Routed::new(device), poll, &matches, quiet)?,
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

/// Extra information only available from one register variant.
trait Describe {
    fn describe(&mut self) -> anyhow::Result<Vec<String>>;
}

impl Describe for Direct<JTAG> {
    fn describe(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(vec![self.dcr()?.to_string()])
    }
}

impl Describe for Routed<JTAG> {
    fn describe(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(vec![
            format!("OCD ID: 0x{:08X}", self.ocd_id()?),
            format!("Power status: 0x{:02X}", self.power_status()?),
        ])
    }
}

fn run<P>(protocol: P, poll: PollConfig, matches: &ArgMatches, quiet: bool) -> anyhow::Result<()>
    where P: DebugRegisterProtocol + Describe
{
    let mut ocd = Ocd::new(protocol, poll)?;

    match matches.subcommand() {
        Some(("info", _)) => {
            println!("Core is {}", ocd.state());
            println!("Status: {}", ocd.status()?);
            for line in ocd.protocol().describe()? {
                println!("{}", line);
            }
        },
        Some(("status", _)) => {
            println!("{}", ocd.status()?);
        },
        Some(("halt", _)) => {
            ocd.halt()?;
            if !quiet { println!("Core halted.") };
        },
        Some(("run", _)) => {
            ocd.run()?;
            if !quiet { println!("Core running.") };
        },
        Some(("release", _)) => {
            ocd.release()?;
            if !quiet { println!("Core released from OCD.") };
        },
        Some(("regs", _)) => {
            let regs = while_halted(&mut ocd, |ocd| Ok(ocd.read_registers()?))?;
            for (idx, value) in regs.iter().enumerate() {
                println!("a{:<2} = 0x{:08X}", idx, value);
            }
        },
        Some(("reg", matches)) => {
            let name = matches.get_one::<String>("name").map(|s| s.as_str()).unwrap_or("list");
            let protocol = ocd.protocol();
            if name == "list" {
                for reg in protocol.register_map().iter() {
                    println!("{:<14} 0x{:02X} {:>2} bits  {}",
                             reg.name, reg.address, reg.width, reg.description);
                }
            } else if let Some(&value) = matches.get_one::<u32>("value") {
                protocol.write_named(name, value)?;
            } else {
                println!("{} = 0x{:08X}", name, protocol.read_named(name)?);
            }
        },
        Some(("read", matches)) => {
            let address = *matches.get_one::<u32>("address").unwrap_or(&0);
            let width = parse_width(matches)?;
            let value = while_halted(&mut ocd, |ocd| Ok(ocd.read_memory(address, width)?))?;
            println!("0x{:08X}: 0x{:0w$X}", address, value, w = width.bytes() as usize * 2);
        },
        Some(("write", matches)) => {
            let address = *matches.get_one::<u32>("address").unwrap_or(&0);
            let value = *matches.get_one::<u32>("value").unwrap_or(&0);
            let width = parse_width(matches)?;
            while_halted(&mut ocd, |ocd| Ok(ocd.write_memory(address, width, value)?))?;
        },
        Some(("dump", matches)) => {
            let address = *matches.get_one::<u32>("address").unwrap_or(&0);
            let length = *matches.get_one::<usize>("length").unwrap_or(&0);
            if length % 4 != 0 {
                bail!("Dump length must be a multiple of 4 bytes.");
            }
            let words = if quiet {
                while_halted(&mut ocd, |ocd| Ok(ocd.read_words(address, length / 4)?))?
            } else {
                let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
                    .template(DATA_PROGRESS_TPL)?.progress_chars(DATA_PROGRESS_CHARS));
                pb.set_message("Reading");
                let words = while_halted(&mut ocd, |ocd| {
                    Ok(ocd.read_words_cb(address, length / 4, |n| pb.set_position(4 * n as u64))?)
                });
                pb.finish();
                words?
            };
            if let Some(path) = matches.get_one::<String>("file") {
                let mut file = File::create(path)?;
                for word in words.iter() {
                    file.write_all(&word.to_le_bytes())?;
                }
            } else {
                print_words(address, &words);
            }
        },
        Some(("exec", matches)) => {
            let name = matches.get_one::<String>("program").map(|s| s.as_str()).unwrap_or("");
            let program = match Program::get(name) {
                Some(program) => program,
                None => bail!("Unknown program {}, see `programs` for a list.", name),
            };
            let inputs: Vec<u32> = matches.get_many::<u32>("inputs")
                                          .map(|v| v.copied().collect())
                                          .unwrap_or_default();
            if ocd.state() != OcdState::Halted {
                bail!("Core must be halted to run programs; use `halt` first.");
            }
            let outputs = ocd.run_program(program, &inputs)?;
            for (idx, value) in outputs.iter().enumerate() {
                println!("{:>2}: 0x{:08X}", idx, value);
            }
        },
        _ => panic!("Unhandled command."),
    }

    Ok(())
}

/// Halt the core if needed, run `f`, then return the core to its previous state.
fn while_halted<P, T, F>(ocd: &mut Ocd<P>, f: F) -> anyhow::Result<T>
    where P: DebugRegisterProtocol, F: FnOnce(&mut Ocd<P>) -> anyhow::Result<T>
{
    let prior = ocd.state();
    ocd.halt()?;
    let result = f(ocd);
    let restored = ocd.enter_state(prior);
    let value = result?;
    restored?;
    Ok(value)
}

fn parse_width(matches: &ArgMatches) -> anyhow::Result<Width> {
    match matches.get_one::<String>("width").map(|w| w.as_str()) {
        Some("8") => Ok(Width::U8),
        Some("16") => Ok(Width::U16),
        Some("32") | None => Ok(Width::U32),
        Some(other) => bail!("Unsupported access width {}.", other),
    }
}

fn print_words(address: u32, words: &[u32]) {
    for (idx, line) in words.chunks(4).enumerate() {
        let line: Vec<String> = line.iter().map(|w| format!("{:08X}", w)).collect();
        println!("0x{:08X}: {}", address.wrapping_add(16 * idx as u32), line.join(" "));
    }
}

fn print_probe_list() {
    let probes = ProbeInfo::list();
    if probes.is_empty() {
        println!("No CMSIS-DAP probes found.");
    } else {
        println!("Found {} CMSIS-DAP probe{}:", probes.len(),
                 if probes.len() == 1 { "" } else { "s" });
        for probe in probes {
            println!("  {}", probe);
        }
    }
}

fn print_program_list() {
    for program in PROGRAMS.iter() {
        let arity = program.arity();
        println!("{} ({} in, {} out): {}",
                 program.name, arity.inputs, arity.outputs, program.description);
        for &opcode in program.opcodes.iter() {
            match program::describe(opcode) {
                Some(text) => println!("    {:06X}  {}", opcode, text),
                None => println!("    {:06X}", opcode),
            }
        }
    }
}

fn print_chain(info: &ChainInfo) {
    println!("Detected JTAG chain with total IR length {}, closest to TDO first:",
             info.layout.ir_length);
    for (idx, idcode) in info.idcodes.iter().enumerate() {
        let tag = if idcode.0 == routed::ESP32_IDCODE { " [ESP32]" } else { "" };
        println!(" - {}: {} part 0x{:04X} version {}{}",
                 idx, idcode, idcode.part_number(), idcode.version(), tag);
    }
}
