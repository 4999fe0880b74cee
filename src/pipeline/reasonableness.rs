//! Stage 3 — physical reasonableness checks
//!
//! Two rule families, both closed-form:
//!
//! - first-derivative bounds: |Δvalue/Δt| must stay under the tag's
//!   configured `max_rate`
//! - cross-tag constraints: `when_tag` satisfying its predicate requires
//!   `require_tag`'s latest value to satisfy its own (e.g. advance_rate > 0
//!   implies thrust_total > 0)
//!
//! Failing records keep their value — the flag is what downstream
//! aggregation counts.

use std::collections::HashMap;

use crate::config::{CrossTagRule, ReasonablenessConfig};

/// Whether the step from `prev` to `curr` exceeds `max_rate` (units/second).
///
/// Samples sharing a timestamp cannot produce a rate and always pass.
pub fn exceeds_max_rate(prev: (i64, f64), curr: (i64, f64), max_rate: f64) -> bool {
    let dt_s = (curr.0 - prev.0) as f64 / 1_000.0;
    if dt_s <= 0.0 {
        return false;
    }
    ((curr.1 - prev.1) / dt_s).abs() > max_rate
}

/// Evaluate all cross-tag rules that involve `tag` against the latest
/// per-tag values. Returns the first violated rule.
///
/// A rule can only fire once both of its tags have been observed; partial
/// knowledge never flags.
pub fn violated_cross_rule<'a>(
    config: &'a ReasonablenessConfig,
    tag: &'a str,
    latest: &HashMap<String, f64>,
) -> Option<&'a CrossTagRule> {
    config
        .rules_for(tag)
        .find(|rule| {
            let (Some(&when_value), Some(&require_value)) =
                (latest.get(&rule.when_tag), latest.get(&rule.require_tag))
            else {
                return false;
            };
            rule.when.holds(when_value) && !rule.require.holds(require_value)
        })
}

impl ReasonablenessConfig {
    /// Cross-tag rules mentioning `tag` on either side.
    fn rules_for<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a CrossTagRule> {
        self.cross_rules
            .iter()
            .filter(move |r| r.when_tag == tag || r.require_tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Predicate;

    #[test]
    fn test_rate_within_bound() {
        // 100 units over 1 s with a 200/s bound
        assert!(!exceeds_max_rate((0, 0.0), (1_000, 100.0), 200.0));
    }

    #[test]
    fn test_rate_exceeded() {
        assert!(exceeds_max_rate((0, 0.0), (1_000, 300.0), 200.0));
        // Negative steps count the same
        assert!(exceeds_max_rate((0, 300.0), (1_000, 0.0), 200.0));
    }

    #[test]
    fn test_zero_dt_passes() {
        assert!(!exceeds_max_rate((1_000, 0.0), (1_000, 1e9), 1.0));
    }

    fn advance_implies_thrust() -> ReasonablenessConfig {
        ReasonablenessConfig {
            max_rate: HashMap::new(),
            cross_rules: vec![CrossTagRule {
                name: "advance_implies_thrust".to_string(),
                when_tag: "advance_rate".to_string(),
                when: Predicate::GreaterThan(0.0),
                require_tag: "thrust_total".to_string(),
                require: Predicate::GreaterThan(0.0),
            }],
        }
    }

    #[test]
    fn test_cross_rule_violation() {
        let config = advance_implies_thrust();
        let mut latest = HashMap::new();
        latest.insert("advance_rate".to_string(), 12.0);
        latest.insert("thrust_total".to_string(), 0.0);
        let hit = violated_cross_rule(&config, "advance_rate", &latest);
        assert_eq!(hit.map(|r| r.name.as_str()), Some("advance_implies_thrust"));
        // The rule also fires when checked from the require side.
        assert!(violated_cross_rule(&config, "thrust_total", &latest).is_some());
    }

    #[test]
    fn test_cross_rule_satisfied() {
        let config = advance_implies_thrust();
        let mut latest = HashMap::new();
        latest.insert("advance_rate".to_string(), 12.0);
        latest.insert("thrust_total".to_string(), 8_000.0);
        assert!(violated_cross_rule(&config, "advance_rate", &latest).is_none());
    }

    #[test]
    fn test_cross_rule_needs_both_tags() {
        let config = advance_implies_thrust();
        let mut latest = HashMap::new();
        latest.insert("advance_rate".to_string(), 12.0);
        assert!(violated_cross_rule(&config, "advance_rate", &latest).is_none());
    }

    #[test]
    fn test_unrelated_tag_ignored() {
        let config = advance_implies_thrust();
        let mut latest = HashMap::new();
        latest.insert("advance_rate".to_string(), 12.0);
        latest.insert("thrust_total".to_string(), 0.0);
        assert!(violated_cross_rule(&config, "chamber_pressure", &latest).is_none());
    }
}
