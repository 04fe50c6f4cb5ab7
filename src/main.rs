use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn, LevelFilter};
use signal_hook::consts::signal;

use once_flash::cable::{self, Cable};
use once_flash::config;
use once_flash::error::Category;
use once_flash::flash::{Block, EraseMode, Progress};
use once_flash::image::{ChecksumPolicy, MemoryImage};
use once_flash::once::Space;
use once_flash::session::{ExitMode, Session, SessionConfig, DEBUG_RETRIES};
use once_flash::srec;
use once_flash::taps::ChainPosition;
use once_flash::{Error, Result};

/// Words per line of a memory view.
const VIEW_WORDS: usize = 8;

/// Program, verify and read the on-chip flash of DSP56F80x processors through JTAG.
#[derive(Parser)]
#[command(version)]
struct Opts {
    /// Flash configuration file (TOML, one [[unit]] table per flash unit).
    config: PathBuf,

    /// S-record file to program, or the output file for --read.
    srec: Option<PathBuf>,

    /// Debug adapter: ft232h, jtagkey, usbblaster, jlink or fake.
    #[arg(short = 'a', long, default_value = "ft232h", env = "ONCE_FLASH_CABLE")]
    cable: String,

    /// Wait for the target to power up or leave reset.
    #[arg(short, long)]
    wait: bool,

    /// Only report warnings and errors.
    #[arg(short, long)]
    quiet: bool,

    /// Leave the target in debug mode when done instead of resetting it.
    #[arg(short = 'd', long)]
    leave_in_debug: bool,

    /// Use records with a bad checksum anyway.
    #[arg(short = 'c', long)]
    ignore_checksum: bool,

    /// Erase only the pages the image touches instead of whole units.
    #[arg(short, long)]
    page_erase: bool,

    /// Work on the information block of every unit instead of the main block.
    #[arg(short, long)]
    info: bool,

    /// Instruction and data register bits in front of the DSP in the JTAG chain.
    #[arg(short = 'm', long, value_name = "IR,DR", value_parser = parse_chain)]
    chain: Option<ChainPosition>,

    /// Additional S-record file, merged after the main one.
    #[arg(short = 't', long, value_name = "SREC")]
    extra: Option<PathBuf>,

    /// Read a memory range into the S-record file, e.g. p0000:7dff.
    #[arg(short, long, value_name = "RANGE", value_parser = parse_range, conflicts_with = "view")]
    read: Option<MemRange>,

    /// Print a memory range, e.g. x1000:103f.
    #[arg(short, long, value_name = "RANGE", value_parser = parse_range)]
    view: Option<MemRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MemRange {
    space: Space,
    start: u16,
    end: u16,
}

enum Operation {
    Program(PathBuf),
    Read(MemRange, PathBuf),
    View(MemRange),
}

fn parse_hex(text: &str) -> std::result::Result<u16, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(digits, 16).map_err(|e| format!("'{}': {}", text, e))
}

fn parse_range(text: &str) -> std::result::Result<MemRange, String> {
    let mut chars = text.chars();
    let space = match chars.next().map(|c| c.to_ascii_lowercase()) {
        Some('p') => Space::P,
        Some('x') => Space::X,
        _ => return Err("range must start with the memory space, p or x".into()),
    };
    let (start, end) = chars
        .as_str()
        .split_once(':')
        .ok_or("range must be written as <space><start>:<end>")?;
    let range = MemRange {
        space,
        start: parse_hex(start)?,
        end: parse_hex(end)?,
    };
    if range.end < range.start {
        return Err(format!("range end {:#06x} is below its start {:#06x}", range.end, range.start));
    }
    Ok(range)
}

fn parse_chain(text: &str) -> std::result::Result<ChainPosition, String> {
    let (instruction, data) = text.split_once(',').ok_or("expected <IR bits>,<DR bits>")?;
    Ok(ChainPosition {
        instruction: instruction.trim().parse().map_err(|e| format!("'{}': {}", instruction, e))?,
        data: data.trim().parse().map_err(|e| format!("'{}': {}", data, e))?,
    })
}

fn exit_code(category: Category) -> u8 {
    match category {
        Category::Success => 0,
        Category::Config => 1,
        Category::Image => 2,
        Category::Verify => 3,
        Category::Protocol => 4,
        Category::Parameter => 5,
    }
}

impl Opts {
    fn operation(&self) -> Result<Operation> {
        match (self.read, self.view, &self.srec) {
            (Some(range), None, Some(path)) => Ok(Operation::Read(range, path.clone())),
            (Some(_), None, None) => Err(Error::Parameter("--read needs an output S-record file".into())),
            (None, Some(range), _) => Ok(Operation::View(range)),
            (None, None, Some(path)) => Ok(Operation::Program(path.clone())),
            (None, None, None) => Err(Error::Parameter(
                "nothing to do: give an S-record file to program, or --read or --view".into(),
            )),
            (Some(_), Some(_), _) => Err(Error::Parameter("--read and --view exclude each other".into())),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            erase: if self.page_erase { EraseMode::Page } else { EraseMode::Mass },
            block: if self.info { Block::Info } else { Block::Main },
            position: self.chain.unwrap_or_default(),
            wait_for_target: self.wait,
            exit: if self.leave_in_debug { ExitMode::LeaveInDebug } else { ExitMode::Reset },
            checksum: if self.ignore_checksum {
                ChecksumPolicy::Ignore
            } else {
                ChecksumPolicy::Strict
            },
            debug_retries: DEBUG_RETRIES,
        }
    }
}

fn load_image(path: &Path) -> Result<MemoryImage> {
    let text = fs::read_to_string(path).map_err(|e| Error::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    srec::parse(&text)
}

/// Feeds flash progress events into a progress bar, one bar per unit and phase.
struct ProgressReport {
    bar: ProgressBar,
}

impl ProgressReport {
    fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let style = ProgressStyle::with_template("{msg:>16} [{bar:40.cyan/blue}] {pos:>6}/{len:6} words")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-");
            ProgressBar::new(0).with_style(style)
        };
        ProgressReport { bar }
    }

    fn phase(&self, message: String, done: usize, total: usize) {
        if self.bar.length() != Some(total as u64) || self.bar.message() != message {
            self.bar.reset();
            self.bar.set_length(total as u64);
            self.bar.set_message(message);
        }
        self.bar.set_position(done as u64);
    }

    fn handle(&self, progress: Progress) {
        match progress {
            Progress::Erased { interface, pages } => match pages {
                Some(pages) => self.bar.println(format!("{:#06x}: {} page(s) erased", interface, pages)),
                None => self.bar.println(format!("{:#06x}: unit erased", interface)),
            },
            Progress::Programmed { interface, done, total } => {
                self.phase(format!("program {:#06x}", interface), done, total)
            }
            Progress::Verified { interface, done, total } => {
                self.phase(format!("verify {:#06x}", interface), done, total)
            }
            Progress::Read { done, total } => self.phase("read".into(), done, total),
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Hex and character dump, one line of `VIEW_WORDS` words per line.  Each word shows its high
/// byte first; bytes that are not printable show as a blank.
fn dump(range: MemRange, words: &[u16]) -> String {
    let mut out = String::new();
    let (name, prefix) = match range.space {
        Space::P => ("Program", 'p'),
        Space::X => ("Data", 'x'),
    };
    out.push_str(&format!("{} memory dump - {:#06x}:{:#06x}\n", name, range.start, range.end));
    for (i, line) in words.chunks(VIEW_WORDS).enumerate() {
        let address = usize::from(range.start) + i * VIEW_WORDS;
        out.push_str(&format!("{}:{:04x}:", prefix, address));
        for word in line {
            out.push_str(&format!(" {:04x}", word));
        }
        for _ in line.len()..VIEW_WORDS {
            out.push_str("     ");
        }
        out.push_str("  ");
        for byte in line.iter().flat_map(|w| w.to_be_bytes()) {
            out.push(if byte.is_ascii_graphic() { char::from(byte) } else { ' ' });
        }
        out.push('\n');
    }
    out
}

fn run(opts: &Opts) -> Result<()> {
    // Every input is checked before the adapter is touched.
    let operation = opts.operation()?;
    let config = opts.session_config();
    let mut layout = config::load(&opts.config)?;

    if let Operation::Program(path) = &operation {
        let mut image = load_image(path)?;
        if let Some(extra) = &opts.extra {
            image.extend(load_image(extra)?);
        }
        let words = image.merge_into(&mut layout, config.checksum)?;
        info!("{} word(s) loaded from {}", words, path.display());
        for unit in layout.units() {
            if unit.data_count() > 0 {
                info!(
                    "{:?}:{:#06x}..{:#06x}: {} word(s) from {:#06x}",
                    unit.space,
                    unit.flash_start,
                    unit.flash_end,
                    unit.data_count(),
                    unit.start_addr()
                );
            }
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal::SIGINT, Arc::clone(&stop)) {
        warn!("Ctrl-C will not stop the work cleanly: {}", e);
    }

    let cable: Box<dyn Cable> = cable::new_from_string(&opts.cable)?;
    let mut session = Session::new(cable, config).with_cancel(stop);
    session.connect()?;
    let target = session.bring_up()?;
    info!(
        "target JTAG ID {:#010x}, chain lengths IR {} DR {}",
        target.idcode, target.lengths.instruction, target.lengths.data
    );

    let report = ProgressReport::new(opts.quiet);
    match operation {
        Operation::Program(_) => {
            let mut flasher = session.flasher()?.with_progress(|p| report.handle(p));
            let result = flasher.program_all(&mut layout);
            report.finish();
            result?;
            info!("Flash programmed and verified.");
        }
        Operation::Read(range, path) => {
            let words = session
                .flasher()?
                .with_progress(|p| report.handle(p))
                .read_range(range.space, range.start, range.end, &layout);
            report.finish();
            let words = words?;
            fs::write(&path, srec::write(range.space, range.start, &words, "once-flash")).map_err(|e| {
                Error::File {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            info!("{} word(s) written to {}", words.len(), path.display());
        }
        Operation::View(range) => {
            let words = session
                .flasher()?
                .read_range(range.space, range.start, range.end, &layout)?;
            print!("{}", dump(range, &words));
        }
    }

    session.disconnect()
}

fn main() -> ExitCode {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(exit_code(Category::Parameter))
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    env_logger::Builder::new()
        .filter_level(if opts.quiet { LevelFilter::Warn } else { LevelFilter::Info })
        .parse_default_env()
        .init();

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(exit_code(e.category()))
        }
    }
}
