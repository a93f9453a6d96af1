//! Client and transaction identifiers

use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lowest client id handed out when none is supplied
pub const MIN_CLIENT_ID: u32 = 1;

/// Highest client id handed out when none is supplied
pub const MAX_CLIENT_ID: u32 = 65536;

/// Identity of one client instance.
///
/// The client id is fixed for the lifetime of the instance. The transaction
/// counter is shared by every call made through the instance and is the only
/// piece of mutable state those calls share.
#[derive(Debug)]
pub struct ClientIdentity {
    client_id: u32,
    transaction_id: AtomicU32,
}

impl ClientIdentity {
    /// Create an identity with a random client id in `1..=65536`
    pub fn random() -> Self {
        let client_id = rand::thread_rng().gen_range(MIN_CLIENT_ID..=MAX_CLIENT_ID);
        Self::with_client_id(client_id)
    }

    /// Create an identity with a caller supplied client id
    pub fn with_client_id(client_id: u32) -> Self {
        Self {
            client_id,
            transaction_id: AtomicU32::new(0),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Allocate the next transaction id. The first id issued is 1.
    pub fn next_transaction_id(&self) -> u32 {
        self.transaction_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Last transaction id issued, 0 if none yet
    pub fn last_transaction_id(&self) -> u32 {
        self.transaction_id.load(Ordering::SeqCst)
    }

    /// Allocate identifiers for one call
    pub fn begin(&self) -> TransactionIds {
        TransactionIds {
            client_id: self.client_id,
            client_transaction_id: self.next_transaction_id(),
        }
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::random()
    }
}

/// Identifiers attached to a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionIds {
    pub client_id: u32,
    pub client_transaction_id: u32,
}

impl TransactionIds {
    /// The two parameters every Alpaca request carries
    pub fn as_params(&self) -> [(String, String); 2] {
        [
            ("ClientID".to_string(), self.client_id.to_string()),
            ("ClientTransactionID".to_string(), self.client_transaction_id.to_string()),
        ]
    }
}
