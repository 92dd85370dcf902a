use clap::Parser;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(
    name = "torrentwatch",
    version,
    about = "Search torrents, stream them into mpv and pick up where you left off"
)]
pub struct Cli {
    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Use the external picker for selections
    #[arg(long, conflicts_with = "no_picker")]
    pub picker: bool,

    /// Use the built-in list for selections
    #[arg(long)]
    pub no_picker: bool,

    /// Remember playback speed between episodes
    #[arg(long, value_name = "BOOL")]
    pub save_speed: Option<bool>,

    /// Download the latest release over the current executable and exit
    #[arg(short = 'u', long)]
    pub update: bool,

    /// Open the config file in $EDITOR and exit
    #[arg(short = 'e', long)]
    pub edit: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config
    pub fn apply(&self, config: &mut Config) {
        if self.picker {
            config.external_picker = true;
        }
        if self.no_picker {
            config.external_picker = false;
        }
        if let Some(save_speed) = self.save_speed {
            config.save_player_speed = save_speed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from(["torrentwatch", "--picker", "--save-speed", "true"]).unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(config.external_picker);
        assert!(config.save_player_speed);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::try_parse_from(["torrentwatch"]).unwrap();
        let mut config = Config {
            external_picker: true,
            ..Config::default()
        };
        cli.apply(&mut config);
        assert!(config.external_picker);
        assert!(!config.save_player_speed);
    }

    #[test]
    fn test_picker_flags_conflict() {
        assert!(Cli::try_parse_from(["torrentwatch", "--picker", "--no-picker"]).is_err());
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from(["torrentwatch", "-u"]).unwrap();
        assert!(cli.update);
        let cli = Cli::try_parse_from(["torrentwatch", "-e"]).unwrap();
        assert!(cli.edit);
    }
}
