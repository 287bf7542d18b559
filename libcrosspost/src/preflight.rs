//! Per-platform readiness checks run before a post may be queued
//!
//! Every requested platform is checked independently and every problem is
//! reported; nothing short-circuits. A readiness gap is data, not an error:
//! the caller records it on the post and holds back the enqueue.

use crate::db::Database;
use crate::error::Result;
use crate::types::{PlatformTarget, PreflightResult};

/// Check one target given whether the owner has a connection for it
pub fn check_target(target: &PlatformTarget, connected: bool) -> PreflightResult {
    let mut issues = Vec::new();

    if !connected {
        issues.push(format!("No {} connection found", target.provider.as_str()));
    }

    let has_board = target
        .board_id
        .as_deref()
        .is_some_and(|b| !b.trim().is_empty());
    if target.provider.requires_board() && !has_board {
        issues.push(format!(
            "{} requires a board selection",
            target.provider.display_name()
        ));
    }

    PreflightResult {
        provider: target.provider,
        connected,
        issues,
    }
}

pub fn all_ready(results: &[PreflightResult]) -> bool {
    results.iter().all(PreflightResult::is_ready)
}

#[derive(Clone)]
pub struct Preflight {
    db: Database,
}

impl Preflight {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One result per target, in request order
    pub async fn check(
        &self,
        owner_id: &str,
        platforms: &[PlatformTarget],
    ) -> Result<Vec<PreflightResult>> {
        let mut results = Vec::with_capacity(platforms.len());
        for target in platforms {
            let connected = self
                .db
                .get_connection(owner_id, target.provider)
                .await?
                .is_some();
            results.push(check_target(target, connected));
        }

        tracing::debug!(
            owner_id = owner_id,
            platforms = platforms.len(),
            ready = all_ready(&results),
            "Preflight complete"
        );

        Ok(results)
    }
}
