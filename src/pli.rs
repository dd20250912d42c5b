use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;

use crate::{rtcp::PictureLossIndication, Error, Result};

/// Routes picture loss indications from the feedback thread to the encoder
/// that owns the stream.
///
/// Each subscriber gets a channel holding at most one pending indication.
/// Indications that arrive while one is pending are merged into it.
#[derive(Debug)]
pub struct PliRegistry {
    capacity: usize,
    subscribers: RwLock<HashMap<u32, Sender<PictureLossIndication>>>,
}

impl PliRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Returns the receiving end for indications about `ssrc`.
    pub fn subscribe(&self, ssrc: u32) -> Result<Receiver<PictureLossIndication>> {
        let mut subscribers = self.subscribers.write();
        if subscribers.contains_key(&ssrc) {
            return Err(Error::DuplicateRegistration(ssrc));
        }
        if subscribers.len() >= self.capacity {
            return Err(Error::RegistryFull {
                capacity: self.capacity,
            });
        }

        let (sender, receiver) = crossbeam_channel::bounded(1);
        subscribers.insert(ssrc, sender);
        tracing::debug!(ssrc, "Subscribed to picture loss indications");
        Ok(receiver)
    }

    pub fn unsubscribe(&self, ssrc: u32) -> Result<()> {
        self.subscribers
            .write()
            .remove(&ssrc)
            .map(|_| ())
            .ok_or(Error::UnknownStream(ssrc))
    }

    /// Queues an indication for its media SSRC. Returns false when one was
    /// already pending and the new one was merged into it.
    ///
    /// A subscriber whose receiver was dropped is removed and reported as unknown.
    pub fn notify(&self, pli: PictureLossIndication) -> Result<bool> {
        let ssrc = pli.media_ssrc;
        let result = {
            let subscribers = self.subscribers.read();
            let sender = subscribers.get(&ssrc).ok_or(Error::UnknownStream(ssrc))?;
            sender.try_send(pli)
        };

        match result {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                tracing::trace!(ssrc, "Picture loss indication already pending");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(ssrc, "Picture loss receiver dropped, unsubscribing");
                self.subscribers.write().remove(&ssrc);
                Err(Error::UnknownStream(ssrc))
            }
        }
    }

    /// Forwards every indication, skipping those for streams nobody listens to.
    /// Returns how many were newly queued.
    pub fn notify_all(&self, indications: &[PictureLossIndication]) -> usize {
        indications
            .iter()
            .filter(|pli| match self.notify(**pli) {
                Ok(queued) => queued,
                Err(err) => {
                    tracing::debug!("Dropping picture loss indication: {}", err);
                    false
                }
            })
            .count()
    }
}
