//! Central Sender
//!
//! Connects to a discovered peer, writes one transfer packet to its card
//! characteristic and cleans up. Link failures are retried through a short
//! fallback ladder, at most once per failure category per send.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::ble::gatt::{CARD_CHAR_UUID, CARD_SERVICE_UUID};
use crate::ble::packet::{create_transfer_packet, is_valid_doc_id};
use crate::ble::transport::{BleCentral, PeerHandle};
use crate::ble::{BleError, LinkFailure};
use crate::config::SenderConfig;

use super::capability::CapabilityGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    /// Disconnect afterwards if this send opened the link.
    pub disconnect_after: bool,
    pub cancelled_retry_delay: Duration,
    /// Bound on each connect attempt. `None` leaves it to the platform.
    pub connection_timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::from(&SenderConfig::default())
    }
}

impl From<&SenderConfig> for SendOptions {
    fn from(config: &SenderConfig) -> Self {
        Self {
            disconnect_after: config.disconnect_after,
            cancelled_retry_delay: Duration::from_millis(config.cancelled_retry_delay_ms),
            connection_timeout: (config.connection_timeout_ms > 0)
                .then(|| Duration::from_millis(config.connection_timeout_ms)),
        }
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Service the packet was finally written under.
    pub service: Uuid,
    pub attempts: u32,
    /// The link existed before this send.
    pub reused_connection: bool,
}

pub struct CentralSender {
    central: Option<Arc<dyn BleCentral>>,
    gate: Arc<CapabilityGate>,
}

impl CentralSender {
    pub fn new(central: Option<Arc<dyn BleCentral>>, gate: Arc<CapabilityGate>) -> Self {
        Self { central, gate }
    }

    /// Send a reference to card `doc_id` to `peer`.
    pub async fn send(
        &self,
        peer: &PeerHandle,
        doc_id: &str,
        sender_label: &str,
        options: &SendOptions,
    ) -> Result<SendReport, BleError> {
        if !is_valid_doc_id(doc_id) {
            return Err(BleError::InvalidInput(format!("invalid document id {:?}", doc_id)));
        }
        if !self.gate.acquire().await {
            return Err(BleError::PermissionDenied);
        }
        let central = self
            .central
            .as_ref()
            .ok_or_else(|| BleError::Unsupported("no central role on this radio".to_string()))?;

        let packet = create_transfer_packet(doc_id, sender_label);
        let reused_connection = ensure_connected(central.as_ref(), peer, options).await?;
        let mut opened_link = !reused_connection;

        let result = write_with_fallbacks(
            central.as_ref(),
            peer,
            packet.as_bytes(),
            options,
            &mut opened_link,
        )
        .await;

        if options.disconnect_after && opened_link {
            if let Err(e) = central.disconnect(peer).await {
                log::warn!("Failed to disconnect from {}: {}", peer, e);
            }
        }

        match result {
            Ok((service, attempts)) => {
                log::info!("Sent card {} to {} in {} attempt(s)", doc_id, peer, attempts);
                Ok(SendReport {
                    service,
                    attempts,
                    reused_connection,
                })
            }
            Err(e) => {
                log::warn!("Sending card {} to {} failed: {}", doc_id, peer, e);
                Err(e)
            }
        }
    }
}

/// Make sure a link to `peer` is up. Returns whether it already was.
///
/// A connect that reports "already connected" means the state query and
/// the connect raced; the link predates this call and counts as reused.
pub async fn ensure_connected(
    central: &dyn BleCentral,
    peer: &PeerHandle,
    options: &SendOptions,
) -> Result<bool, BleError> {
    if let Ok(true) = central.is_connected(peer).await {
        return Ok(true);
    }

    let outcome = match options.connection_timeout {
        Some(limit) => tokio::time::timeout(limit, central.connect(peer))
            .await
            .map_err(|_| BleError::Timeout)?,
        None => central.connect(peer).await,
    };
    match outcome {
        Ok(()) => Ok(false),
        Err(BleError::AlreadyConnected) => {
            log::debug!("{} reported already connected; reusing link", peer);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

async fn write_with_fallbacks(
    central: &dyn BleCentral,
    peer: &PeerHandle,
    data: &[u8],
    options: &SendOptions,
    opened_link: &mut bool,
) -> Result<(Uuid, u32), BleError> {
    let mut service = CARD_SERVICE_UUID;
    let mut attempts = 0;
    let mut used = HashSet::new();

    loop {
        attempts += 1;
        let err = match central.write(peer, service, CARD_CHAR_UUID, data).await {
            Ok(()) => return Ok((service, attempts)),
            Err(e) => e,
        };

        let category = err.link_failure();
        if category == LinkFailure::Fatal || !used.insert(category) {
            return Err(err);
        }
        log::warn!("Write to {} failed ({}); trying {:?} fallback", peer, err, category);

        match category {
            LinkFailure::MissingService => match find_hosting_service(central, peer).await? {
                Some(found) => service = found,
                None => return Err(err),
            },
            LinkFailure::Cancelled => tokio::time::sleep(options.cancelled_retry_delay).await,
            LinkFailure::Disconnected => {
                if !ensure_connected(central, peer, options).await? {
                    *opened_link = true;
                }
            }
            LinkFailure::Fatal => return Err(err),
        }
    }
}

/// Search the peer's services for one hosting the card characteristic.
async fn find_hosting_service(
    central: &dyn BleCentral,
    peer: &PeerHandle,
) -> Result<Option<Uuid>, BleError> {
    let services = central.services(peer).await?;
    Ok(services
        .iter()
        .find(|s| s.has_characteristic(&CARD_CHAR_UUID))
        .map(|s| s.uuid))
}
