/*
    core_node - The local node

    A LocalNode holds one account's agent secret, its session and the
    in-memory replicas of every CoValue it has loaded. It creates, mutates
    and deletes CoValues on behalf of that account, loads missing ones from
    storage and peers, and answers the peer protocol through SyncHost.

    Every change is written through to storage before it is broadcast.
*/

pub mod content;
pub mod errors;
pub mod gc;
pub mod groups;
pub mod host;
pub mod loading;
pub mod node;
pub mod registry;
pub mod transaction;

pub use content::DecryptedTransaction;
pub use errors::{LoadOutcome, NodeError, NodeResult};
pub use gc::GcReport;
pub use groups::GroupOptions;
pub use node::{LocalNode, NodeInner};
pub use registry::Registry;
pub use transaction::{Privacy, TransactionContext};
