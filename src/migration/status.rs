//! Migration status reconciliation
//!
//! Joins the resolved catalog with the schema history and classifies every migration
//! key found in either. The result drives `info`, `validate` and the pending list that
//! `migrate` executes.

use crate::migration::{
    AppliedMigration, Checksum, MigrationError, MigrationKey, MigrationVersion, ResolvedMigration,
    TargetVersion,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Derived state of a migration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    /// Resolved and waiting to be applied
    Pending,
    /// Applied successfully
    Success,
    /// Applied and failed; blocks further runs until repaired
    Failed,
    /// Applied but no longer resolved locally
    Missing,
    /// Superseded run of a repeatable migration
    Ignored,
    /// Resolved below the highest applied version while out-of-order is not allowed
    Outdated,
    /// Above the target version
    Future,
    /// At or below the baseline version; never executed
    BelowBaseline,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Pending => "PENDING",
            MigrationState::Success => "SUCCESS",
            MigrationState::Failed => "FAILED",
            MigrationState::Missing => "MISSING",
            MigrationState::Ignored => "IGNORED",
            MigrationState::Outdated => "OUTDATED",
            MigrationState::Future => "FUTURE",
            MigrationState::BelowBaseline => "BELOW_BASELINE",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options that change how resolved migrations are classified
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub target: TargetVersion,
    pub allow_out_of_order: bool,
}

/// Options that decide which conditions make validation fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub validate_checksums: bool,
    /// Treat `MISSING` migrations as errors instead of warnings
    pub strict: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            validate_checksums: true,
            strict: false,
        }
    }
}

/// One classified migration key, joined with its catalog and history entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    pub key: MigrationKey,
    pub state: MigrationState,
    pub resolved: Option<ResolvedMigration>,
    pub applied: Option<AppliedMigration>,
}

impl MigrationInfo {
    pub fn description(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|r| r.description.as_str())
            .or_else(|| self.applied.as_ref().map(|a| a.description.as_str()))
            .unwrap_or_default()
    }

    pub fn installed_rank(&self) -> Option<i32> {
        self.applied.as_ref().map(|a| a.installed_rank)
    }

    /// Checksums of both sides when they diverge
    ///
    /// Baseline markers carry no checksum and never mismatch.
    pub fn checksum_mismatch(&self) -> Option<(Checksum, Checksum)> {
        let resolved = self.resolved.as_ref()?.checksum;
        let applied = self.applied.as_ref()?.checksum?;
        (applied != resolved).then_some((applied, resolved))
    }
}

/// Classification of every migration key for one run
#[derive(Debug, Clone, Default)]
pub struct MigrationInfoSet {
    infos: Vec<MigrationInfo>,
    baseline: Option<MigrationVersion>,
    highest_applied: Option<MigrationVersion>,
}

impl MigrationInfoSet {
    /// Classify the catalog against the history
    ///
    /// # Arguments
    ///
    /// * `catalog` - Resolved migrations, as returned by the resolver
    /// * `history` - All history rows ordered by rank
    /// * `policy` - Target ceiling and out-of-order authorization
    pub fn reconcile(
        catalog: &[ResolvedMigration],
        history: &[AppliedMigration],
        policy: &ReconcilePolicy,
    ) -> Self {
        // Latest row per key; earlier rows for the same key are superseded
        let mut current: HashMap<MigrationKey, &AppliedMigration> = HashMap::new();
        let mut superseded: Vec<&AppliedMigration> = Vec::new();
        for row in history {
            if let Some(previous) = current.insert(row.key(), row) {
                if previous.installed_rank > row.installed_rank {
                    current.insert(previous.key(), previous);
                    superseded.push(row);
                } else {
                    superseded.push(previous);
                }
            }
        }

        let baseline = history
            .iter()
            .filter(|row| row.is_baseline() && row.success)
            .filter_map(|row| row.version.clone())
            .max();
        let highest_applied = history
            .iter()
            .filter(|row| row.success)
            .filter_map(|row| row.version.clone())
            .max();

        let mut infos = Vec::with_capacity(catalog.len() + history.len());
        for migration in catalog {
            let key = migration.key();
            let applied = current.remove(&key);
            let state = match (&migration.version, applied) {
                (_, Some(row)) if !row.success => MigrationState::Failed,
                (Some(_), Some(row)) if row.is_baseline() => MigrationState::BelowBaseline,
                (Some(_), Some(_)) => MigrationState::Success,
                (None, Some(row)) if row.checksum == Some(migration.checksum) => {
                    MigrationState::Success
                }
                (None, _) => MigrationState::Pending,
                (Some(version), None) => {
                    classify_unapplied(version, baseline.as_ref(), highest_applied.as_ref(), policy)
                }
            };
            infos.push(MigrationInfo {
                key,
                state,
                resolved: Some(migration.clone()),
                applied: applied.cloned(),
            });
        }

        for (key, row) in current {
            let state = if !row.success {
                MigrationState::Failed
            } else if row.is_baseline() {
                MigrationState::Success
            } else {
                MigrationState::Missing
            };
            infos.push(MigrationInfo {
                key,
                state,
                resolved: None,
                applied: Some(row.clone()),
            });
        }
        for row in superseded {
            infos.push(MigrationInfo {
                key: row.key(),
                state: MigrationState::Ignored,
                resolved: None,
                applied: Some(row.clone()),
            });
        }

        infos.sort_by(compare_infos);
        Self {
            infos,
            baseline,
            highest_applied,
        }
    }

    pub fn all(&self) -> &[MigrationInfo] {
        &self.infos
    }

    pub fn baseline(&self) -> Option<&MigrationVersion> {
        self.baseline.as_ref()
    }

    pub fn highest_applied(&self) -> Option<&MigrationVersion> {
        self.highest_applied.as_ref()
    }

    pub fn with_state(&self, state: MigrationState) -> impl Iterator<Item = &MigrationInfo> {
        self.infos.iter().filter(move |info| info.state == state)
    }

    /// Migrations to execute, in execution order
    ///
    /// Versioned migrations come first in ascending version order, then repeatable
    /// migrations by description.
    pub fn pending(&self) -> Vec<&ResolvedMigration> {
        self.with_state(MigrationState::Pending)
            .filter_map(|info| info.resolved.as_ref())
            .collect()
    }

    /// Check the classification against `policy`
    ///
    /// # Errors
    ///
    /// In order of precedence: `FailedMigration` for a failed history row,
    /// `ChecksumMismatch` for a modified versioned migration (unless checksum
    /// validation is off), `OutOfOrder` for `OUTDATED` migrations, and
    /// `MissingMigration` in strict mode.
    pub fn validate(&self, policy: &ValidationPolicy) -> Result<(), MigrationError> {
        if let Some(info) = self.with_state(MigrationState::Failed).next() {
            return Err(MigrationError::FailedMigration {
                key: info.key.clone(),
                rank: info.installed_rank().unwrap_or_default(),
            });
        }

        if policy.validate_checksums {
            let mismatch = self
                .with_state(MigrationState::Success)
                .filter(|info| !info.key.is_repeatable())
                .find_map(|info| info.checksum_mismatch().map(|sums| (info, sums)));
            if let Some((info, (applied, resolved))) = mismatch {
                return Err(MigrationError::ChecksumMismatch {
                    key: info.key.clone(),
                    applied,
                    resolved,
                });
            }
        }

        let outdated: Vec<MigrationVersion> = self
            .with_state(MigrationState::Outdated)
            .filter_map(|info| info.key.version().cloned())
            .collect();
        if let (false, Some(highest)) = (outdated.is_empty(), &self.highest_applied) {
            return Err(MigrationError::OutOfOrder {
                versions: outdated,
                highest_applied: highest.clone(),
            });
        }

        let missing: Vec<MigrationKey> = self
            .with_state(MigrationState::Missing)
            .map(|info| info.key.clone())
            .collect();
        if !missing.is_empty() {
            if policy.strict {
                return Err(MigrationError::MissingMigration { keys: missing });
            }
            for key in &missing {
                log::warn!("Applied migration {key} is not resolved locally");
            }
        }

        Ok(())
    }
}

fn classify_unapplied(
    version: &MigrationVersion,
    baseline: Option<&MigrationVersion>,
    highest_applied: Option<&MigrationVersion>,
    policy: &ReconcilePolicy,
) -> MigrationState {
    if policy.target.excludes(version) {
        MigrationState::Future
    } else if baseline.is_some_and(|b| version <= b) {
        MigrationState::BelowBaseline
    } else if highest_applied.map_or(true, |h| version > h) || policy.allow_out_of_order {
        MigrationState::Pending
    } else {
        MigrationState::Outdated
    }
}

fn compare_infos(a: &MigrationInfo, b: &MigrationInfo) -> Ordering {
    let by_key = match (&a.key, &b.key) {
        (MigrationKey::Versioned(x), MigrationKey::Versioned(y)) => x.cmp(y),
        (MigrationKey::Versioned(_), MigrationKey::Repeatable(_)) => Ordering::Less,
        (MigrationKey::Repeatable(_), MigrationKey::Versioned(_)) => Ordering::Greater,
        (MigrationKey::Repeatable(x), MigrationKey::Repeatable(y)) => x.cmp(y),
    };
    // Superseded rows sort before the current row, pending entries last
    by_key.then_with(|| match (a.installed_rank(), b.installed_rank()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}

impl fmt::Display for MigrationInfoSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<6} {:<12} {:<40} {:<14} {:<20}",
            "Rank", "Version", "Description", "State", "Installed on"
        )?;
        for info in &self.infos {
            let rank = info
                .installed_rank()
                .map(|r| r.to_string())
                .unwrap_or_default();
            let version = info
                .key
                .version()
                .map(ToString::to_string)
                .unwrap_or_default();
            let installed_on = info
                .applied
                .as_ref()
                .map(|a| a.installed_on.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            writeln!(
                f,
                "{rank:<6} {version:<12} {:<40} {:<14} {installed_on:<20}",
                info.description(),
                info.state.as_str()
            )?;
        }
        Ok(())
    }
}
