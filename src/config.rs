use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::model::{LayoutRules, ZUniqueness};
use crate::optimizer::SearchConfig;

/// Looks up a raw configuration value by variable name.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Complete application configuration, loaded from environment variables or default values.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub planner: PlannerConfig,
}

impl AppConfig {
    /// Creates a configuration from the currently available environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(&env_string)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Self {
        Self {
            api: ApiConfig::from_lookup(lookup),
            planner: PlannerConfig::from_lookup(lookup),
        }
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    bind_ip: IpAddr,
    display_host: String,
    port: u16,
}

impl ApiConfig {
    const DEFAULT_HOST: &'static str = "0.0.0.0";
    const DEFAULT_PORT: u16 = 8080;
    const HOST_VAR: &'static str = "MEASURE_PLANNER_API_HOST";
    const PORT_VAR: &'static str = "MEASURE_PLANNER_API_PORT";

    fn from_lookup(lookup: Lookup<'_>) -> Self {
        let host_value = lookup(Self::HOST_VAR).unwrap_or_else(|| Self::DEFAULT_HOST.to_string());
        let (bind_ip, display_host) = match host_value.parse::<IpAddr>() {
            Ok(ip) => (ip, host_value),
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}'): {}. Using {}.",
                    Self::HOST_VAR,
                    host_value,
                    err,
                    Self::DEFAULT_HOST
                );
                (
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    Self::DEFAULT_HOST.to_string(),
                )
            }
        };

        let port = load_parsed_with_warning(
            lookup,
            Self::PORT_VAR,
            Self::DEFAULT_PORT,
            |value| value != 0,
            "must not be 0",
        );

        Self {
            bind_ip,
            display_host,
            port,
        }
    }

    /// Socket address to bind the server to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Visible hostname for logging and hints.
    pub fn display_host(&self) -> &str {
        &self.display_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Indicates whether binding to all interfaces.
    pub fn binds_to_all_interfaces(&self) -> bool {
        match self.bind_ip {
            IpAddr::V4(addr) => addr == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(addr) => addr == Ipv6Addr::UNSPECIFIED,
        }
    }
}

/// Layout rules and search bounds used by every request.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    rules: LayoutRules,
    search: SearchConfig,
}

impl PlannerConfig {
    const MARGIN_VAR: &'static str = "MEASURE_PLANNER_MARGIN";
    const SOURCE_DISTANCE_VAR: &'static str = "MEASURE_PLANNER_MIN_SOURCE_DISTANCE";
    const POINT_SPACING_VAR: &'static str = "MEASURE_PLANNER_MIN_POINT_SPACING";
    const SOURCE_SEPARATION_VAR: &'static str = "MEASURE_PLANNER_MIN_SOURCE_SEPARATION";
    const Z_UNIQUENESS_VAR: &'static str = "MEASURE_PLANNER_Z_UNIQUENESS";
    const NODE_BUDGET_VAR: &'static str = "MEASURE_PLANNER_NODE_BUDGET";
    const MAX_SOLUTIONS_VAR: &'static str = "MEASURE_PLANNER_MAX_SOLUTIONS";
    const REFINEMENT_PASSES_VAR: &'static str = "MEASURE_PLANNER_REFINEMENT_PASSES";
    const TIME_LIMIT_VAR: &'static str = "MEASURE_PLANNER_TIME_LIMIT_MS";

    /// Wall-clock limit of a search run in the service, in milliseconds.
    pub const DEFAULT_TIME_LIMIT_MS: u64 = 2_000;

    fn from_lookup(lookup: Lookup<'_>) -> Self {
        let margin = load_f64_with_warning(
            lookup,
            Self::MARGIN_VAR,
            LayoutRules::DEFAULT_MARGIN,
            |value| value >= 0.0,
            "must be zero or positive",
            "Adjusted wall margin changes the candidate space",
        );

        let min_source_distance = load_f64_with_warning(
            lookup,
            Self::SOURCE_DISTANCE_VAR,
            LayoutRules::DEFAULT_MIN_SOURCE_DISTANCE,
            |value| value >= 0.0,
            "must be zero or positive",
            "Adjusted source distance deviates from the measurement standard",
        );

        let min_point_spacing = load_f64_with_warning(
            lookup,
            Self::POINT_SPACING_VAR,
            LayoutRules::DEFAULT_MIN_POINT_SPACING,
            |value| value > 0.0,
            "must be greater than 0",
            "Adjusted point spacing deviates from the measurement standard",
        );

        let min_source_separation = load_f64_with_warning(
            lookup,
            Self::SOURCE_SEPARATION_VAR,
            LayoutRules::DEFAULT_MIN_SOURCE_SEPARATION,
            |value| value >= 0.0,
            "must be zero or positive",
            "Adjusted source separation deviates from the measurement standard",
        );

        let z_uniqueness = lookup(Self::Z_UNIQUENESS_VAR)
            .and_then(|raw| parse_z_uniqueness(&raw, Self::Z_UNIQUENESS_VAR))
            .unwrap_or_default();

        let rules = LayoutRules::builder()
            .margin(margin)
            .min_source_distance(min_source_distance)
            .min_point_spacing(min_point_spacing)
            .min_source_separation(min_source_separation)
            .z_uniqueness(z_uniqueness)
            .build();

        let node_budget = load_parsed_with_warning(
            lookup,
            Self::NODE_BUDGET_VAR,
            SearchConfig::DEFAULT_NODE_BUDGET,
            |value| value > 0,
            "must be greater than 0",
        );
        let max_solutions = load_parsed_with_warning(
            lookup,
            Self::MAX_SOLUTIONS_VAR,
            SearchConfig::DEFAULT_MAX_SOLUTIONS,
            |value| value > 0,
            "must be greater than 0",
        );
        let refinement_passes = load_parsed_with_warning(
            lookup,
            Self::REFINEMENT_PASSES_VAR,
            SearchConfig::DEFAULT_REFINEMENT_PASSES,
            |value| value <= 100,
            "must not exceed 100",
        );
        let time_limit_ms = load_parsed_with_warning(
            lookup,
            Self::TIME_LIMIT_VAR,
            Self::DEFAULT_TIME_LIMIT_MS,
            |_| true,
            "",
        );
        if time_limit_ms == 0 {
            info!("Search time limit disabled ({} = 0).", Self::TIME_LIMIT_VAR);
        }

        let search = SearchConfig::builder()
            .node_budget(node_budget)
            .max_solutions(max_solutions)
            .refinement_passes(refinement_passes)
            .time_limit((time_limit_ms > 0).then(|| Duration::from_millis(time_limit_ms)))
            .build();

        Self { rules, search }
    }

    /// Returns the configured layout rules.
    pub fn layout_rules(&self) -> LayoutRules {
        self.rules
    }

    /// Returns the configured search bounds.
    pub fn search_config(&self) -> SearchConfig {
        self.search
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::from_lookup(&|_| None)
    }
}

/// Variable holding the tracing filter directives.
const LOG_FILTER_VAR: &str = "RUST_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// Tracing filter directives, read once the `.env` file has been loaded.
pub fn log_filter() -> String {
    log_filter_from(&env_string)
}

fn log_filter_from(lookup: Lookup<'_>) -> String {
    lookup(LOG_FILTER_VAR).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!("Access to {} failed: {}. Using default value.", name, err);
            None
        }
    }
}

fn parse_z_uniqueness(raw: &str, var_name: &str) -> Option<ZUniqueness> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "measurements" | "measurements_only" => Some(ZUniqueness::MeasurementsOnly),
        "all" | "all_active_points" => Some(ZUniqueness::AllActivePoints),
        other => {
            warn!(
                "Could not interpret {} ('{}'): expected 'measurements' or 'all'. Using default value.",
                var_name, other
            );
            None
        }
    }
}

fn load_parsed_with_warning<T>(
    lookup: Lookup<'_>,
    var_name: &str,
    default: T,
    validator: impl Fn(T) -> bool,
    invalid_hint: &str,
) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
{
    match lookup(var_name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) if validator(value) => value,
            Ok(_) => {
                warn!(
                    "{} contains invalid value '{}': {}. Using {}.",
                    var_name, raw, invalid_hint, default
                );
                default
            }
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}'): {}. Using {}.",
                    var_name, raw, err, default
                );
                default
            }
        },
        None => default,
    }
}

fn load_f64_with_warning(
    lookup: Lookup<'_>,
    var_name: &str,
    default: f64,
    validator: impl Fn(f64) -> bool,
    invalid_hint: &str,
    warning: &str,
) -> f64 {
    let value = load_parsed_with_warning(
        lookup,
        var_name,
        default,
        |value: f64| value.is_finite() && validator(value),
        invalid_hint,
    );
    let tolerance = default.abs().max(1.0) * 1e-9;
    if (value - default).abs() > tolerance {
        warn!("{} ({} = {}).", warning, var_name, value);
    }
    value
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_log_filter_uses_rust_log() {
        assert_eq!(log_filter_from(&|_| None), "info");
        let lookup = lookup_from(&[("RUST_LOG", "measure_planner=debug")]);
        assert_eq!(log_filter_from(&lookup), "measure_planner=debug");
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = AppConfig::from_lookup(&|_| None);
        assert_eq!(config.api.port(), 8080);
        assert!(config.api.binds_to_all_interfaces());
        assert_eq!(config.planner.layout_rules(), LayoutRules::default());

        let search = config.planner.search_config();
        assert_eq!(search.node_budget, SearchConfig::DEFAULT_NODE_BUDGET);
        assert_eq!(
            search.time_limit,
            Some(Duration::from_millis(PlannerConfig::DEFAULT_TIME_LIMIT_MS))
        );
    }

    #[test]
    fn test_overrides_are_applied() {
        let lookup = lookup_from(&[
            ("MEASURE_PLANNER_API_HOST", "127.0.0.1"),
            ("MEASURE_PLANNER_API_PORT", "9000"),
            ("MEASURE_PLANNER_MARGIN", "0.3"),
            ("MEASURE_PLANNER_MIN_POINT_SPACING", "1.0"),
            ("MEASURE_PLANNER_Z_UNIQUENESS", "ALL"),
            ("MEASURE_PLANNER_NODE_BUDGET", "1000"),
            ("MEASURE_PLANNER_MAX_SOLUTIONS", "5"),
            ("MEASURE_PLANNER_TIME_LIMIT_MS", "0"),
        ]);
        let config = AppConfig::from_lookup(&lookup);
        assert_eq!(
            config.api.socket_addr(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(!config.api.binds_to_all_interfaces());

        let rules = config.planner.layout_rules();
        assert_eq!(rules.margin, 0.3);
        assert_eq!(rules.min_point_spacing, 1.0);
        assert_eq!(rules.z_uniqueness, ZUniqueness::AllActivePoints);

        let search = config.planner.search_config();
        assert_eq!(search.node_budget, 1000);
        assert_eq!(search.max_solutions, 5);
        assert_eq!(search.time_limit, None);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let lookup = lookup_from(&[
            ("MEASURE_PLANNER_API_HOST", "not-an-ip"),
            ("MEASURE_PLANNER_API_PORT", "0"),
            ("MEASURE_PLANNER_MARGIN", "-1"),
            ("MEASURE_PLANNER_MIN_POINT_SPACING", "NaN"),
            ("MEASURE_PLANNER_Z_UNIQUENESS", "sometimes"),
            ("MEASURE_PLANNER_NODE_BUDGET", "lots"),
        ]);
        let config = AppConfig::from_lookup(&lookup);
        assert_eq!(config.api.display_host(), "0.0.0.0");
        assert_eq!(config.api.port(), 8080);
        assert_eq!(config.planner.layout_rules(), LayoutRules::default());
        assert_eq!(
            config.planner.search_config().node_budget,
            SearchConfig::DEFAULT_NODE_BUDGET
        );
    }

    #[test]
    fn test_parse_z_uniqueness_values() {
        assert_eq!(
            parse_z_uniqueness("measurements", "TEST_VAR"),
            Some(ZUniqueness::MeasurementsOnly)
        );
        assert_eq!(
            parse_z_uniqueness(" all_active_points ", "TEST_VAR"),
            Some(ZUniqueness::AllActivePoints)
        );
        assert_eq!(parse_z_uniqueness("maybe", "TEST_VAR"), None);
        assert_eq!(parse_z_uniqueness("", "TEST_VAR"), None);
    }
}
