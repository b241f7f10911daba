// Parsing command line options

use crate::analysis::reached_set::WaitlistOrder;
use log::{info, warn};

const DEFAULT_MAX_DEPTH: u32 = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisOption {
    // Reuse block results computed with another precision, and enforce exact hits on repair
    pub aggressive_caching: bool,
    pub waitlist_order: WaitlistOrder,
    // Maximal nesting of block analyses before the exploration gives up
    pub max_depth: u32,
    // Print the statistics as JSON instead of text
    pub stats_json: bool,
}

impl Default for AnalysisOption {
    fn default() -> Self {
        Self {
            aggressive_caching: false,
            waitlist_order: WaitlistOrder::Fifo,
            max_depth: DEFAULT_MAX_DEPTH,
            stats_json: false,
        }
    }
}

impl AnalysisOption {
    /// Parse `--flag` and `--flag value` arguments, the first argument is the program name
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let args = args.into_iter().collect::<Vec<_>>();
        let mut res = Self::default();
        for (i, arg) in args.iter().enumerate() {
            if let Some(flag) = arg.strip_prefix("--") {
                let value = args.get(i + 1).map(|value| value.as_str());
                match flag {
                    "aggressive-caching" => {
                        res.aggressive_caching = true;
                    }
                    "stats-json" => {
                        res.stats_json = true;
                    }
                    "waitlist" => {
                        res.waitlist_order = match value {
                            Some("fifo") => WaitlistOrder::Fifo,
                            Some("lifo") => WaitlistOrder::Lifo,
                            _ => {
                                warn!("Unrecognized waitlist order, using default: fifo");
                                WaitlistOrder::Fifo
                            }
                        };
                    }
                    "max-depth" => {
                        res.max_depth = match value.and_then(|value| value.parse().ok()) {
                            Some(depth) => depth,
                            None => {
                                warn!(
                                    "Unrecognized maximal depth, using default: {}",
                                    DEFAULT_MAX_DEPTH
                                );
                                DEFAULT_MAX_DEPTH
                            }
                        };
                    }
                    _ => {
                        warn!("Ignoring unknown option: {}", arg);
                    }
                }
            }
        }
        info!("Analysis options: {:?}", res);
        res
    }
}
