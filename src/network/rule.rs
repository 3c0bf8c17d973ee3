use std::fmt::Write as _;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Value meaning "leave this parameter out of the rendered command".
pub const OMIT_SENTINEL: &str = "-1";

/// Traffic direction a shaping rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => bail!("unknown traffic direction {other:?}"),
        }
    }
}

/// Whether a rule installs or removes shaping on the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Set,
    Del,
}

impl RuleAction {
    /// The tcconfig binary implementing the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Set => "tcset",
            RuleAction::Del => "tcdel",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "set" => Ok(RuleAction::Set),
            "del" => Ok(RuleAction::Del),
            other => bail!("unknown rule action {other:?}"),
        }
    }
}

static RATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?[KMGT]?bps$").expect("valid regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(us|ms|s|min)?$").expect("valid regex"));
static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?%?$").expect("valid regex"));
static COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").expect("valid regex"));

/// Shaping parameter, one per tcconfig flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleParam {
    Rate,
    Delay,
    DelayDistro,
    Loss,
    Duplicate,
    Corrupt,
    Reordering,
    Limit,
}

impl RuleParam {
    /// Flag name as it appears both in rule files and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleParam::Rate => "rate",
            RuleParam::Delay => "delay",
            RuleParam::DelayDistro => "delay-distro",
            RuleParam::Loss => "loss",
            RuleParam::Duplicate => "duplicate",
            RuleParam::Corrupt => "corrupt",
            RuleParam::Reordering => "reordering",
            RuleParam::Limit => "limit",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "rate" => Ok(RuleParam::Rate),
            "delay" => Ok(RuleParam::Delay),
            "delay-distro" => Ok(RuleParam::DelayDistro),
            "loss" => Ok(RuleParam::Loss),
            "duplicate" => Ok(RuleParam::Duplicate),
            "corrupt" => Ok(RuleParam::Corrupt),
            "reordering" => Ok(RuleParam::Reordering),
            "limit" => Ok(RuleParam::Limit),
            other => bail!("unknown shaping parameter {other:?}"),
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            RuleParam::Rate => &RATE_RE,
            RuleParam::Delay | RuleParam::DelayDistro => &TIME_RE,
            RuleParam::Loss | RuleParam::Duplicate | RuleParam::Corrupt | RuleParam::Reordering => {
                &PERCENT_RE
            }
            RuleParam::Limit => &COUNT_RE,
        }
    }

    /// Check a value against the parameter's syntax. The omit sentinel is
    /// always acceptable.
    pub fn validate_value(&self, value: &str) -> Result<()> {
        if value == OMIT_SENTINEL {
            return Ok(());
        }
        if !self.pattern().is_match(value) {
            bail!("{value:?} is not a valid {} value", self.as_str());
        }
        Ok(())
    }
}

/// Render one tcconfig invocation. Parameters holding the omit sentinel
/// are left out entirely.
pub fn render_command(
    action: RuleAction,
    interface: &str,
    direction: Direction,
    args: &[(RuleParam, &str)],
) -> String {
    let mut cmd = format!(
        "{} {} --direction {}",
        action.as_str(),
        interface,
        direction.as_str()
    );
    for (param, value) in args {
        if *value != OMIT_SENTINEL {
            let _ = write!(cmd, " --{} {}", param.as_str(), value);
        }
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_full_command() {
        let cmd = render_command(
            RuleAction::Set,
            "eth0",
            Direction::Outgoing,
            &[(RuleParam::Rate, "100Mbps"), (RuleParam::Delay, "10ms")],
        );
        assert_eq!(cmd, "tcset eth0 --direction outgoing --rate 100Mbps --delay 10ms");
    }

    #[test]
    fn test_render_omits_sentinel_values() {
        let cmd = render_command(
            RuleAction::Set,
            "eth0",
            Direction::Incoming,
            &[
                (RuleParam::Rate, "-1"),
                (RuleParam::Delay, "5ms"),
                (RuleParam::Loss, "-1"),
            ],
        );
        assert_eq!(cmd, "tcset eth0 --direction incoming --delay 5ms");
    }

    #[test]
    fn test_render_delete() {
        let cmd = render_command(RuleAction::Del, "eth0", Direction::Outgoing, &[]);
        assert_eq!(cmd, "tcdel eth0 --direction outgoing");
    }

    #[test]
    fn test_rate_values() {
        assert!(RuleParam::Rate.validate_value("100Mbps").is_ok());
        assert!(RuleParam::Rate.validate_value("0.5Gbps").is_ok());
        assert!(RuleParam::Rate.validate_value("300bps").is_ok());
        assert!(RuleParam::Rate.validate_value("-1").is_ok());
        assert!(RuleParam::Rate.validate_value("100").is_err());
        assert!(RuleParam::Rate.validate_value("fastbps").is_err());
        assert!(RuleParam::Rate.validate_value("100 Mbps").is_err());
    }

    #[test]
    fn test_delay_values() {
        assert!(RuleParam::Delay.validate_value("10ms").is_ok());
        assert!(RuleParam::Delay.validate_value("0.5s").is_ok());
        assert!(RuleParam::Delay.validate_value("100us").is_ok());
        assert!(RuleParam::Delay.validate_value("2min").is_ok());
        assert!(RuleParam::Delay.validate_value("10").is_ok());
        assert!(RuleParam::Delay.validate_value("10h").is_err());
        assert!(RuleParam::DelayDistro.validate_value("2ms").is_ok());
    }

    #[test]
    fn test_percent_values() {
        assert!(RuleParam::Loss.validate_value("0.1%").is_ok());
        assert!(RuleParam::Loss.validate_value("5").is_ok());
        assert!(RuleParam::Corrupt.validate_value("1.5%").is_ok());
        assert!(RuleParam::Loss.validate_value("lossy").is_err());
        assert!(RuleParam::Reordering.validate_value("%5").is_err());
    }

    #[test]
    fn test_limit_values() {
        assert!(RuleParam::Limit.validate_value("1000").is_ok());
        assert!(RuleParam::Limit.validate_value("1000.5").is_err());
        assert!(RuleParam::Limit.validate_value("1000p").is_err());
    }

    #[test]
    fn test_parse_round_trips() {
        for param in [
            RuleParam::Rate,
            RuleParam::Delay,
            RuleParam::DelayDistro,
            RuleParam::Loss,
            RuleParam::Duplicate,
            RuleParam::Corrupt,
            RuleParam::Reordering,
            RuleParam::Limit,
        ] {
            assert_eq!(RuleParam::parse(param.as_str()).expect("should parse"), param);
        }
        assert!(RuleParam::parse("bandwidth").is_err());

        assert_eq!(Direction::parse("incoming").expect("should parse"), Direction::Incoming);
        assert!(Direction::parse("both").is_err());

        assert_eq!(RuleAction::parse("set").expect("should parse"), RuleAction::Set);
        assert_eq!(RuleAction::parse("del").expect("should parse"), RuleAction::Del);
        assert!(RuleAction::parse("tcset").is_err());
    }
}
