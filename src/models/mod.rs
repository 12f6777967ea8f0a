pub mod session;

pub use session::{ActivitySession, GroupingKey};
