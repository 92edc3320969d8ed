use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use pagealloc::software::{EmulatedPlatform, EmulatedProcFs, ZoneConfig};
use pagealloc::{DEFAULT_ROOT, ModuleConfig, PageAllocModule, ZoneId};

mod burnin;
mod console;
mod tree;

#[derive(Parser)]
#[command(name = "pagectl")]
#[command(about = "Memory burn-in driver for the pagealloc control files")]
struct Args {
    /// Log more; repeat for more detail
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log less; repeat to silence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    command: Command,
}

/// Shape of the emulated memory node and where the control tree lives.
#[derive(clap::Args)]
struct NodeArgs {
    /// Pages in the low-memory zone
    #[arg(long, default_value_t = 4096)]
    low_pages: usize,

    /// Reserve the low-memory zone keeps free
    #[arg(long, default_value_t = 256)]
    low_min: usize,

    /// Pages in the high-memory zone; 0 for a node without high memory
    #[arg(long, default_value_t = 8192)]
    high_pages: usize,

    /// Reserve the high-memory zone keeps free
    #[arg(long, default_value_t = 512)]
    high_min: usize,

    /// Name of the control tree's root directory
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: String,
}

impl NodeArgs {
    fn zones(&self) -> Vec<ZoneConfig> {
        let mut zones = vec![ZoneConfig::new(ZoneId::LowMem, self.low_pages, self.low_min)];
        if self.high_pages > 0 {
            zones.push(ZoneConfig::new(
                ZoneId::HighMem,
                self.high_pages,
                self.high_min,
            ));
        }
        zones
    }
}

#[derive(Subcommand)]
enum Command {
    /// Allocate, pattern-fill, verify and free blocks
    BurnIn {
        /// Byte pattern (decimal or 0x-prefixed hexadecimal)
        #[arg(short, long, default_value = "0xA5", value_parser = parse_pattern)]
        pattern: u8,

        /// Pages to request per pass
        #[arg(short = 'n', long, default_value_t = 256)]
        pages: usize,

        /// Passes per zone
        #[arg(long, default_value_t = 4)]
        passes: usize,

        /// Zone to test; both when omitted
        #[arg(short, long)]
        zone: Option<ZoneArg>,
    },
    /// Print the control tree and the contents of its readable files
    Tree,
}

#[derive(Clone, Copy, ValueEnum)]
enum ZoneArg {
    Low,
    High,
}

impl From<ZoneArg> for ZoneId {
    fn from(zone: ZoneArg) -> Self {
        match zone {
            ZoneArg::Low => ZoneId::LowMem,
            ZoneArg::High => ZoneId::HighMem,
        }
    }
}

fn parse_pattern(value: &str) -> Result<u8, std::num::ParseIntError> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    console::Console::init(args.verbose, args.quiet);

    let fs = Arc::new(EmulatedProcFs::new());
    let platform = EmulatedPlatform::new(&args.node.zones());
    let config = ModuleConfig {
        root: args.node.root.clone(),
    };
    let module = match PageAllocModule::init(platform, Arc::clone(&fs), &config) {
        Ok(module) => module,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let status = match args.command {
        Command::BurnIn {
            pattern,
            pages,
            passes,
            zone,
        } => {
            let plan = burnin::Plan {
                pattern,
                pages,
                passes,
                zones: zone.map_or_else(|| ZoneId::ALL.to_vec(), |zone| vec![zone.into()]),
            };
            report(burnin::run(&fs, &config.root, &plan))
        }
        Command::Tree => {
            print!("{}", tree::render(&fs, &config.root));
            ExitCode::SUCCESS
        }
    };

    module.exit();
    status
}

fn report(results: Vec<(ZoneId, Result<burnin::ZoneReport, burnin::BurnInError>)>) -> ExitCode {
    let mut status = ExitCode::SUCCESS;
    for (zone, result) in results {
        match result {
            Ok(report) => {
                println!(
                    "{zone}: {} passes, {} pages, {} bad",
                    report.passes, report.pages_tested, report.bad_pages
                );
                if report.bad_pages > 0 {
                    status = ExitCode::FAILURE;
                }
            }
            Err(err) => {
                println!("{zone}: failed: {err}");
                status = ExitCode::FAILURE;
            }
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_accept_hex_and_decimal() {
        assert_eq!(parse_pattern("0xA5"), Ok(0xA5));
        assert_eq!(parse_pattern("0Xff"), Ok(0xFF));
        assert_eq!(parse_pattern("17"), Ok(17));
        assert!(parse_pattern("0x1FF").is_err());
        assert!(parse_pattern("pattern").is_err());
    }

    #[test]
    fn arguments_parse() {
        let args = Args::try_parse_from([
            "pagectl", "-vv", "--high-pages", "0", "burn-in", "-p", "0x5a", "-n", "8", "--zone",
            "low",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.node.zones().len(), 1);
        match args.command {
            Command::BurnIn {
                pattern,
                pages,
                passes,
                zone,
            } => {
                assert_eq!((pattern, pages, passes), (0x5A, 8, 4));
                assert!(matches!(zone, Some(ZoneArg::Low)));
            }
            Command::Tree => panic!("expected burn-in"),
        }
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
