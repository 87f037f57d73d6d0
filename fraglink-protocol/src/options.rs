//! Fragmentation Options
//!
//! Parameter bundle applied to a sender/receiver pair. The marshal layer
//! owning the engines uses `maximum_fragment_age` to time out stalled
//! entries; the engines themselves consume the remaining fields.

use crate::receiver::FragmentReceiver;
use crate::sender::FragmentSender;
use std::time::Duration;
use thiserror::Error;

/// Configuration bounds violations.
#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("maximum fragment age {0:?} is below the 2 second floor")]
    AgeTooSmall(Duration),

    #[error("fragmentation split size must be at least 1")]
    SplitSizeTooSmall,

    #[error("empty sends until forced must be at least 1")]
    EmptySendsTooSmall,
}

/// Fragmentation parameter bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentationOptions {
    /// Age at which the owning marshal should drop a stalled entry.
    pub maximum_fragment_age: Duration,
    /// Largest fragment body in bytes.
    pub split_size: usize,
    /// Barren outbound polls a receiver entry tolerates before forcing
    /// completion or a retry request.
    pub empty_sends_until_forced: u32,
    /// Echo fragment bodies in acknowledgements.
    pub verify_fragments: bool,
    /// Re-send until every echoed body matches; requires
    /// `verify_fragments`.
    pub equality_verify_fragments: bool,
}

impl Default for FragmentationOptions {
    fn default() -> Self {
        FragmentationOptions {
            maximum_fragment_age: Duration::from_secs(30),
            split_size: 448,
            empty_sends_until_forced: 2,
            verify_fragments: false,
            equality_verify_fragments: false,
        }
    }
}

impl FragmentationOptions {
    /// Checks every field against its bound.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.maximum_fragment_age < Duration::from_secs(2) {
            return Err(OptionsError::AgeTooSmall(self.maximum_fragment_age));
        }
        if self.split_size < 1 {
            return Err(OptionsError::SplitSizeTooSmall);
        }
        if self.empty_sends_until_forced < 1 {
            return Err(OptionsError::EmptySendsTooSmall);
        }
        Ok(())
    }

    /// Applies the bundle to a sender. Idempotent.
    pub fn setup_sender(&self, sender: &FragmentSender) {
        sender.set_split_size(self.split_size);
        sender.set_verify_responses(self.verify_fragments);
        sender.set_verify_equality(self.equality_verify_fragments);
    }

    /// Applies the bundle to a receiver. Idempotent.
    pub fn setup_receiver(&self, receiver: &FragmentReceiver) {
        receiver.set_empty_sends_until_forced(self.empty_sends_until_forced);
        receiver.set_verify_responses(self.verify_fragments);
        receiver.set_verify_equality(self.equality_verify_fragments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let options = FragmentationOptions::default();
        assert_eq!(options.split_size, 448);
        assert_eq!(options.empty_sends_until_forced, 2);
        assert_eq!(options.maximum_fragment_age, Duration::from_secs(30));
        assert!(!options.verify_fragments);
        assert!(!options.equality_verify_fragments);
        options.validate().unwrap();
    }

    #[test]
    fn test_bounds_rejected() {
        let mut options = FragmentationOptions {
            maximum_fragment_age: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(OptionsError::AgeTooSmall(_))));

        options.maximum_fragment_age = Duration::from_secs(2);
        options.split_size = 0;
        assert!(matches!(
            options.validate(),
            Err(OptionsError::SplitSizeTooSmall)
        ));

        options.split_size = 1;
        options.empty_sends_until_forced = 0;
        assert!(matches!(
            options.validate(),
            Err(OptionsError::EmptySendsTooSmall)
        ));

        options.empty_sends_until_forced = 1;
        options.validate().unwrap();
    }

    #[test]
    fn test_setup_applies_bundle() {
        use crate::factory::PacketFactory;
        use crate::loader::PacketLoader;

        let options = FragmentationOptions {
            split_size: 64,
            empty_sends_until_forced: 5,
            verify_fragments: true,
            equality_verify_fragments: true,
            ..Default::default()
        };

        let loader = PacketLoader::new();
        let sender = FragmentSender::new(loader.clone());
        options.setup_sender(&sender);
        assert_eq!(sender.split_size(), 64);
        assert!(sender.verify_responses());
        assert!(sender.verify_equality());

        let receiver = FragmentReceiver::new(loader.clone(), PacketFactory::new(false, loader));
        options.setup_receiver(&receiver);
        assert_eq!(receiver.empty_sends_until_forced(), 5);
        assert!(receiver.verify_responses());
        assert!(receiver.verify_equality());
    }
}
