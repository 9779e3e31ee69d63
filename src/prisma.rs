//! PRISMA flow counter
//!
//! Tracks the identified → deduplicated → screened → included funnel and
//! rejects any update that would break a flow-diagram invariant, so the
//! final report stays consistent even under partial phase execution.

use crate::error::{ReviewError, ReviewResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of all PRISMA quantities.
///
/// Stage fields are `Option` so a partially-executed run serializes
/// faithfully: an invariant only binds between stages that have actually
/// been recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrismaCounts {
    /// Records identified, per database
    #[serde(default)]
    pub found: BTreeMap<String, u64>,
    #[serde(default)]
    pub no_dupes: Option<u64>,
    #[serde(default)]
    pub screened: Option<u64>,
    #[serde(default)]
    pub screen_exclusions: Option<u64>,
    #[serde(default)]
    pub fulltext_sought: Option<u64>,
    #[serde(default)]
    pub fulltext_not_retrieved: Option<u64>,
    #[serde(default)]
    pub fulltext_assessed: Option<u64>,
    #[serde(default)]
    pub fulltext_exclusions: Option<u64>,
    #[serde(default)]
    pub qualitative: Option<u64>,
    #[serde(default)]
    pub quantitative: Option<u64>,
}

impl PrismaCounts {
    /// Sum of records identified across all databases.
    pub fn total_found(&self) -> u64 {
        self.found.values().sum()
    }

    /// Papers included after full-text exclusions, when known.
    pub fn included(&self) -> Option<u64> {
        Some(self.fulltext_assessed?.checked_sub(self.fulltext_exclusions?)?)
    }

    /// Check every flow invariant against this snapshot.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(no_dupes) = self.no_dupes {
            if !self.found.is_empty() && self.total_found() < no_dupes {
                return Err(format!(
                    "no_dupes ({}) exceeds records identified ({})",
                    no_dupes,
                    self.total_found()
                ));
            }
            if let Some(screened) = self.screened {
                if screened > no_dupes {
                    return Err(format!(
                        "screened ({}) exceeds no_dupes ({})",
                        screened, no_dupes
                    ));
                }
            }
        }
        if let (Some(screened), Some(excl)) = (self.screened, self.screen_exclusions) {
            if excl > screened {
                return Err(format!(
                    "screen_exclusions ({}) exceeds screened ({})",
                    excl, screened
                ));
            }
            if let Some(sought) = self.fulltext_sought {
                if sought != screened - excl {
                    return Err(format!(
                        "fulltext_sought ({}) != screened - screen_exclusions ({})",
                        sought,
                        screened - excl
                    ));
                }
            }
        }
        if let (Some(sought), Some(not_retrieved)) =
            (self.fulltext_sought, self.fulltext_not_retrieved)
        {
            if not_retrieved > sought {
                return Err(format!(
                    "fulltext_not_retrieved ({}) exceeds fulltext_sought ({})",
                    not_retrieved, sought
                ));
            }
            if let Some(assessed) = self.fulltext_assessed {
                if assessed != sought - not_retrieved {
                    return Err(format!(
                        "fulltext_assessed ({}) != fulltext_sought - fulltext_not_retrieved ({})",
                        assessed,
                        sought - not_retrieved
                    ));
                }
            }
        }
        if let (Some(assessed), Some(excl)) = (self.fulltext_assessed, self.fulltext_exclusions) {
            if excl > assessed {
                return Err(format!(
                    "fulltext_exclusions ({}) exceeds fulltext_assessed ({})",
                    excl, assessed
                ));
            }
            let included = assessed - excl;
            if let Some(qual) = self.qualitative {
                if qual > included {
                    return Err(format!(
                        "qualitative ({}) exceeds included ({})",
                        qual, included
                    ));
                }
            }
            if let Some(quant) = self.quantitative {
                if quant > included {
                    return Err(format!(
                        "quantitative ({}) exceeds included ({})",
                        quant, included
                    ));
                }
            }
        }
        if let (Some(qual), Some(quant)) = (self.qualitative, self.quantitative) {
            if quant > qual {
                return Err(format!(
                    "quantitative ({}) exceeds qualitative ({})",
                    quant, qual
                ));
            }
        }
        Ok(())
    }
}

/// Invariant-preserving counter. Single writer; all updates go through
/// typed setters that validate the proposed state and fail closed.
#[derive(Debug, Default)]
pub struct PrismaCounter {
    inner: Mutex<PrismaCounts>,
}

impl PrismaCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, apply: F) -> ReviewResult<()>
    where
        F: FnOnce(&mut PrismaCounts),
    {
        let mut guard = self.inner.lock();
        let mut proposed = guard.clone();
        apply(&mut proposed);
        proposed
            .validate()
            .map_err(ReviewError::PrismaInvariant)?;
        *guard = proposed;
        Ok(())
    }

    /// Records identified, per database.
    pub fn set_found(&self, by_db: BTreeMap<String, u64>) -> ReviewResult<()> {
        self.update(|c| c.found = by_db)
    }

    pub fn set_no_dupes(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.no_dupes = Some(n))
    }

    pub fn set_screened(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.screened = Some(n))
    }

    pub fn set_screen_exclusions(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.screen_exclusions = Some(n))
    }

    pub fn set_fulltext_sought(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.fulltext_sought = Some(n))
    }

    pub fn set_fulltext_not_retrieved(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.fulltext_not_retrieved = Some(n))
    }

    pub fn set_fulltext_assessed(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.fulltext_assessed = Some(n))
    }

    pub fn set_fulltext_exclusions(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.fulltext_exclusions = Some(n))
    }

    pub fn set_qualitative(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.qualitative = Some(n))
    }

    pub fn set_quantitative(&self, n: u64) -> ReviewResult<()> {
        self.update(|c| c.quantitative = Some(n))
    }

    /// Replace the whole state from a checkpoint snapshot (resume).
    pub fn restore(&self, snapshot: PrismaCounts) -> ReviewResult<()> {
        snapshot
            .validate()
            .map_err(ReviewError::PrismaInvariant)?;
        *self.inner.lock() = snapshot;
        Ok(())
    }

    pub fn counts(&self) -> PrismaCounts {
        self.inner.lock().clone()
    }

    pub fn by_database(&self) -> BTreeMap<String, u64> {
        self.inner.lock().found.clone()
    }
}
