use crate::Config;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

/// Command-line flags. Any flag left unset here leaves the corresponding
/// config value untouched (file/env layer wins).
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "repogate", about = "Caching proxy for APK/APT repositories")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the listen address, e.g. `0.0.0.0:3142`.
    #[arg(long)]
    pub addr: Option<String>,

    /// Override the cache directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Override the cache size limit, e.g. `10GB`.
    #[arg(long)]
    pub max_size: Option<String>,

    /// `-v`/`-q` repeated for more/less log output; defaults to `info`.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Cli {
    pub fn apply(&self, config: &mut Config) {
        if let Some(addr) = &self.addr {
            config.server.addr = addr.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = dir.clone();
        }
        if let Some(size) = &self.max_size {
            if let Some(bytes) = crate::parse_size(size) {
                config.cache.max_size = bytes;
            }
        }
    }

    /// Maps the `-v`/`-q` count to a `tracing` level filter, falling back
    /// to `RUST_LOG` / a sane default when unset.
    pub fn log_filter(&self) -> LevelFilter {
        self.verbose.tracing_level_filter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbosity_maps_to_filter_level() {
        let cli = Cli::default();
        assert_eq!(cli.log_filter(), LevelFilter::INFO);

        let cli = Cli::try_parse_from(["repogate", "-vv"]).unwrap();
        assert_eq!(cli.log_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn cli_overrides_win_over_existing_config() {
        let mut config = Config::default();
        let cli = Cli {
            addr: Some("127.0.0.1:9999".to_string()),
            ..Cli::default()
        };
        cli.apply(&mut config);
        assert_eq!(config.server.addr, "127.0.0.1:9999");
    }
}
