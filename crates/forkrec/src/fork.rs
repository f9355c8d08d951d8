//! Recording-session lifecycle and fork bookkeeping.
//!
//! A [`RecordingSession`] binds a browser window to the fork simulating its
//! transactions. The [`ForkSessionManager`] owns every session and drives
//! the remote fork resource through the [`ForkProvisioner`]: exactly one
//! fork may be attributed to a window at any time, and a fork that stops
//! being referenced is released, never leaked.

use std::collections::HashMap;
use std::time::SystemTime;

use alloy_primitives::{Sign, I256, U256};
use tracing::{info, warn};
use url::Url;

use crate::{ChainId, ForkProvisioner, ProvisionError, ProvisionedFork, WindowId};

/// The per-window binding between an active fork and the ledger being built
/// against it.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    /// Window this session belongs to.
    pub window_id: WindowId,
    /// Chain being simulated.
    pub chain_id: ChainId,
    /// The provisioned fork. `None` while provisioning is in flight or after
    /// provisioning failed; no call may reach a live network in that state.
    pub fork: Option<ProvisionedFork>,
    /// When the session was started.
    pub created_at: SystemTime,
}

impl RecordingSession {
    fn new(window_id: WindowId, chain_id: ChainId) -> Self {
        Self { window_id, chain_id, fork: None, created_at: SystemTime::now() }
    }

    /// The fork's RPC endpoint, once provisioned.
    pub fn fork_rpc_url(&self) -> Option<&Url> {
        self.fork.as_ref().map(|fork| &fork.rpc_url)
    }

    /// Height of the baseline chain state, once provisioned.
    pub fn baseline_block_height(&self) -> Option<u64> {
        self.fork.as_ref().map(|fork| fork.block_height)
    }

    /// Whether the session has a usable fork.
    pub fn is_provisioned(&self) -> bool {
        self.fork.is_some()
    }
}

/// Creates, updates, and tears down the remote fork for each window.
#[derive(Debug)]
pub struct ForkSessionManager<P> {
    provisioner: P,
    sessions: HashMap<WindowId, RecordingSession>,
}

impl<P: ForkProvisioner> ForkSessionManager<P> {
    /// Creates a manager with no active sessions.
    pub fn new(provisioner: P) -> Self {
        Self { provisioner, sessions: HashMap::new() }
    }

    /// Starts a session for `window_id`, replacing any existing one. The old
    /// fork is released before the new one is provisioned, so two forks are
    /// never attributed to the same window.
    ///
    /// On provisioning failure the session remains registered without a
    /// fork: calls against it are refused rather than passed to a live
    /// network.
    pub async fn start(
        &mut self,
        window_id: WindowId,
        chain_id: ChainId,
        base_rpc: Option<&Url>,
    ) -> Result<&RecordingSession, ProvisionError> {
        if let Some(old) = self.sessions.remove(&window_id) {
            self.release(old).await;
        }
        self.sessions.insert(window_id, RecordingSession::new(window_id, chain_id));

        let fork = self.provisioner.create_fork(chain_id, base_rpc).await?;
        info!(%window_id, chain_id, fork = %fork.id, "recording session started");

        let session = self
            .sessions
            .get_mut(&window_id)
            .ok_or(ProvisionError::NoSession(window_id))?;
        session.fork = Some(fork);
        Ok(session)
    }

    /// Swaps the session's fork to one created from `base_rpc`, keeping all
    /// ledger state. The previous fork is released after the new one exists,
    /// so a failed swap leaves the old fork serving.
    pub async fn update(
        &mut self,
        window_id: WindowId,
        base_rpc: &Url,
    ) -> Result<&RecordingSession, ProvisionError> {
        let chain_id = self
            .sessions
            .get(&window_id)
            .ok_or(ProvisionError::NoSession(window_id))?
            .chain_id;

        let fork = self.provisioner.create_fork(chain_id, Some(base_rpc)).await?;
        info!(%window_id, fork = %fork.id, "recording session fork updated");

        let session = self
            .sessions
            .get_mut(&window_id)
            .ok_or(ProvisionError::NoSession(window_id))?;
        let old = session.fork.replace(fork);
        if let Some(old) = old {
            if let Err(error) = self.provisioner.delete_fork(&old.id).await {
                warn!(fork = %old.id, %error, "failed to release replaced fork");
            }
        }
        self.sessions.get(&window_id).ok_or(ProvisionError::NoSession(window_id))
    }

    /// Stops the session for `window_id` and releases its fork. Safe to call
    /// when no session exists or provisioning never completed: both are
    /// no-ops, not errors.
    pub async fn stop(&mut self, window_id: WindowId) -> Result<(), ProvisionError> {
        let Some(session) = self.sessions.remove(&window_id) else {
            return Ok(());
        };
        match session.fork {
            Some(fork) => {
                self.provisioner.delete_fork(&fork.id).await?;
                info!(%window_id, fork = %fork.id, "recording session stopped");
                Ok(())
            }
            None => {
                info!(%window_id, "recording session stopped before provisioning completed");
                Ok(())
            }
        }
    }

    /// Releases a replaced session's fork, tolerating service failures: the
    /// replacement must proceed either way.
    async fn release(&self, session: RecordingSession) {
        if let Some(fork) = session.fork {
            if let Err(error) = self.provisioner.delete_fork(&fork.id).await {
                warn!(fork = %fork.id, %error, "failed to release fork of replaced session");
            }
        }
    }

    /// The active session for a window, if any.
    pub fn session(&self, window_id: WindowId) -> Option<&RecordingSession> {
        self.sessions.get(&window_id)
    }

    /// Windows with an active session.
    pub fn active_windows(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.sessions.keys().copied()
    }
}

/// Errors from balance normalization.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BalanceError {
    /// The input is not a decimal number.
    #[error("'{0}' is not a decimal number")]
    InvalidNumber(String),
    /// The normalized value exceeds the representable range.
    #[error("balance value out of range")]
    Overflow,
}

/// Computes `fork_value - baseline` with both decimal strings normalized to
/// `precision` fractional digits before subtracting.
///
/// Normalizing first avoids false-positive deltas between a human-entered
/// balance string and an integer token amount: `"1.5"` and `"1.50"` diff to
/// zero at any precision. Excess fractional digits are truncated, not
/// rounded, so the comparison is stable.
pub fn balance_delta(baseline: &str, fork_value: &str, precision: u32) -> Result<I256, BalanceError> {
    let baseline = normalize_decimal(baseline, precision)?;
    let fork_value = normalize_decimal(fork_value, precision)?;
    fork_value.checked_sub(baseline).ok_or(BalanceError::Overflow)
}

/// Parses a decimal string into a fixed-point integer with `precision`
/// fractional digits.
fn normalize_decimal(input: &str, precision: u32) -> Result<I256, BalanceError> {
    let trimmed = input.trim();
    let invalid = || BalanceError::InvalidNumber(input.to_owned());

    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (Sign::Negative, rest),
        None => (Sign::Positive, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    // Scale the fraction to exactly `precision` digits: truncate the excess,
    // pad the shortfall.
    let precision = precision as usize;
    let mut scaled = String::with_capacity(int_part.len() + precision);
    scaled.push_str(int_part);
    scaled.push_str(&frac_part[..frac_part.len().min(precision)]);
    for _ in frac_part.len().min(precision)..precision {
        scaled.push('0');
    }
    if scaled.is_empty() {
        scaled.push('0');
    }

    let magnitude = U256::from_str_radix(&scaled, 10).map_err(|_| BalanceError::Overflow)?;
    I256::checked_from_sign_and_abs(sign, magnitude).ok_or(BalanceError::Overflow)
}
