//! Subscriber setup from `--verbose`, `RUST_LOG` and the `logging` config section.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use voxline_core::config::LoggingConfig;

/// Filter directives used when `RUST_LOG` is unset.
pub fn filter_directives(verbose: bool, logging: Option<&LoggingConfig>) -> Vec<String> {
    let level = if verbose {
        "debug"
    } else {
        logging.and_then(|l| l.level.as_deref()).unwrap_or("info")
    };
    let mut directives = vec![level.to_string()];
    if let Some(logging) = logging {
        directives.extend(logging.filters.iter().cloned());
    }
    directives
}

pub fn init(verbose: bool, logging: Option<&LoggingConfig>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new("");
        for directive in filter_directives(verbose, logging) {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("ignoring log filter {directive:?}: {e}"),
            }
        }
        filter
    });

    let json = logging.is_some_and(|l| l.format.eq_ignore_ascii_case("json"));
    let stdout = logging.is_some_and(|l| l.output.eq_ignore_ascii_case("stdout"));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match (json, stdout) {
        (true, true) => fmt::layer().json().with_writer(std::io::stdout).boxed(),
        (true, false) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (false, true) => fmt::layer().with_writer(std::io::stdout).boxed(),
        (false, false) => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_info() {
        assert_eq!(filter_directives(false, None), vec!["info"]);
    }

    #[test]
    fn test_verbose_wins_over_config_level() {
        let logging = LoggingConfig {
            level: Some("warn".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(filter_directives(true, Some(&logging)), vec!["debug"]);
        assert_eq!(filter_directives(false, Some(&logging)), vec!["warn"]);
    }

    #[test]
    fn test_per_crate_filters_follow_level() {
        let logging = LoggingConfig {
            filters: vec!["voxline_live=trace".into(), "tungstenite=warn".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(
            filter_directives(false, Some(&logging)),
            vec!["info", "voxline_live=trace", "tungstenite=warn"]
        );
    }
}
