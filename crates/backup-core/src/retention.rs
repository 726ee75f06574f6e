//! Retention policies for backup chains.
//!
//! Chains are ranked newest first by their full point. The newest regular
//! chain is always kept. Older chains are kept while they fit both the count
//! budget and the age budget (age measured from the chain's newest point)
//! and removed as a whole once they do not.
//!
//! Pre-restore points sit outside both budgets: each one is kept until the
//! first successful login after the restore it protects, plus
//! `safety_login_grace` further logins.

use crate::catalog::{ChainIndex, Removal};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Drop chains whose newest point is older than this.
    pub max_age_days: Option<u32>,
    /// Keep at most this many regular chains.
    pub max_chains: Option<usize>,
    /// Extra logins a pre-restore point survives after the first one
    /// following its restore.
    pub safety_login_grace: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: Some(90),
            max_chains: Some(10),
            safety_login_grace: 0,
        }
    }
}

/// Chains and safety points that are due for removal, by head point id.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RetentionPlan {
    pub expired_chains: Vec<String>,
    pub expired_safety: Vec<String>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.expired_chains.is_empty() && self.expired_safety.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub removed: Vec<Removal>,
    pub kept_chains: usize,
}

impl RetentionReport {
    pub fn removed_points(&self) -> usize {
        self.removed.iter().map(|r| r.dependents.len() + 1).sum()
    }
}

#[derive(Debug, Clone)]
pub struct RetentionEnforcer {
    policy: RetentionPolicy,
}

impl RetentionEnforcer {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Work out what is due without touching the index. Chains containing a
    /// point in `protected` are never planned for removal.
    pub fn plan(&self, index: &ChainIndex, now: DateTime<Utc>, protected: &HashSet<String>) -> RetentionPlan {
        let mut plan = RetentionPlan::default();
        let max_age = self.policy.max_age_days.map(|d| Duration::days(d as i64));
        let max_chains = self.policy.max_chains.map(|m| m.max(1));

        let mut rank = 0usize;
        for chain in index.chains_newest_first() {
            let is_protected = chain.points.iter().any(|p| protected.contains(&p.id));

            if chain.is_safety() {
                let head = chain.head();
                let due = index
                    .safety_hold(&head.id)
                    .map(|hold| hold.logins_seen > self.policy.safety_login_grace)
                    .unwrap_or(false);
                if due && !is_protected {
                    plan.expired_safety.push(head.id.clone());
                }
                continue;
            }

            let position = rank;
            rank += 1;
            if position == 0 {
                // newest chain, kept regardless of age or count
                continue;
            }

            let over_count = max_chains.map(|m| position >= m).unwrap_or(false);
            let over_age = max_age
                .map(|age| now - chain.latest().created_at > age)
                .unwrap_or(false);
            if (over_count || over_age) && !is_protected {
                debug!(chain = %chain.chain_id, over_count, over_age, "chain expired");
                plan.expired_chains.push(chain.head().id.clone());
            }
        }
        plan
    }

    /// Apply the plan to the index. Removed archives are the caller's to
    /// delete.
    pub fn enforce(
        &self,
        index: &mut ChainIndex,
        now: DateTime<Utc>,
        protected: &HashSet<String>,
    ) -> Result<RetentionReport> {
        let plan = self.plan(index, now, protected);
        let mut report = RetentionReport::default();
        for head in plan.expired_chains.iter().chain(plan.expired_safety.iter()) {
            report.removed.push(index.remove(head, true)?);
        }
        report.kept_chains = index.chains_newest_first().len();
        if !plan.is_empty() {
            info!(
                chains = plan.expired_chains.len(),
                safety = plan.expired_safety.len(),
                points = report.removed_points(),
                "retention removed expired backups"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{entry, point};
    use crate::point::PointKind;

    fn index_with_chains(now: DateTime<Utc>, ages_days: &[i64]) -> ChainIndex {
        let mut index = ChainIndex::new();
        for (i, age) in ages_days.iter().enumerate() {
            let t = now - Duration::days(*age);
            let full = format!("F{i}");
            let chain = format!("c{i}");
            index
                .insert(point(&full, &chain, None, PointKind::Full, t, vec![entry("a", "1")], vec![]))
                .unwrap();
            index
                .insert(point(
                    &format!("I{i}"),
                    &chain,
                    Some(&full),
                    PointKind::Incremental,
                    t + Duration::hours(1),
                    vec![entry("a", "2")],
                    vec![],
                ))
                .unwrap();
        }
        index
    }

    #[test]
    fn newest_chain_survives_any_age() {
        let now = Utc::now();
        let mut index = index_with_chains(now, &[400]);
        let enforcer = RetentionEnforcer::new(RetentionPolicy {
            max_age_days: Some(30),
            max_chains: Some(1),
            safety_login_grace: 1,
        });
        let report = enforcer.enforce(&mut index, now, &HashSet::new()).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn count_budget_removes_oldest_chains_with_dependents() {
        let now = Utc::now();
        let mut index = index_with_chains(now, &[1, 2, 3, 4]);
        let enforcer = RetentionEnforcer::new(RetentionPolicy {
            max_age_days: None,
            max_chains: Some(2),
            safety_login_grace: 1,
        });
        let report = enforcer.enforce(&mut index, now, &HashSet::new()).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.removed_points(), 4);
        assert!(index.get("F0").is_some());
        assert!(index.get("F1").is_some());
        assert!(index.get("F2").is_none());
        assert!(index.get("I3").is_none());
    }

    #[test]
    fn age_budget_uses_newest_point_of_chain() {
        let now = Utc::now();
        let mut index = index_with_chains(now, &[1, 40, 100]);
        let enforcer = RetentionEnforcer::new(RetentionPolicy {
            max_age_days: Some(60),
            max_chains: None,
            safety_login_grace: 1,
        });
        let plan = enforcer.plan(&index, now, &HashSet::new());
        assert_eq!(plan.expired_chains, vec!["F2".to_string()]);
        enforcer.enforce(&mut index, now, &HashSet::new()).unwrap();
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn protected_chain_is_kept() {
        let now = Utc::now();
        let index = index_with_chains(now, &[1, 2, 3]);
        let enforcer = RetentionEnforcer::new(RetentionPolicy {
            max_age_days: None,
            max_chains: Some(1),
            safety_login_grace: 1,
        });
        let protected: HashSet<String> = ["I2".to_string()].into_iter().collect();
        let plan = enforcer.plan(&index, now, &protected);
        assert_eq!(plan.expired_chains, vec!["F1".to_string()]);
    }

    #[test]
    fn safety_points_expire_at_first_login() {
        let now = Utc::now();
        let mut index = index_with_chains(now, &[1]);
        index
            .insert(point("S1", "s1", None, PointKind::PreRestore, now, vec![], vec![]))
            .unwrap();
        index.add_safety_hold("S1", now);
        let enforcer = RetentionEnforcer::new(RetentionPolicy {
            max_chains: Some(1),
            ..RetentionPolicy::default()
        });

        // a safety chain does not count against max_chains
        assert!(enforcer.plan(&index, now, &HashSet::new()).is_empty());

        index.record_login();
        let report = enforcer.enforce(&mut index, now, &HashSet::new()).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.removed[0].point.id, "S1");
        assert!(index.safety_hold("S1").is_none());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn login_grace_delays_safety_expiry() {
        let now = Utc::now();
        let mut index = ChainIndex::new();
        index
            .insert(point("S1", "s1", None, PointKind::PreRestore, now, vec![], vec![]))
            .unwrap();
        index.add_safety_hold("S1", now);
        let enforcer = RetentionEnforcer::new(RetentionPolicy {
            safety_login_grace: 1,
            ..RetentionPolicy::default()
        });

        index.record_login();
        assert!(enforcer.plan(&index, now, &HashSet::new()).is_empty());
        index.record_login();
        assert_eq!(
            enforcer.plan(&index, now, &HashSet::new()).expired_safety,
            vec!["S1".to_string()]
        );
    }
}
