pub mod status;
pub mod diagnostics;
pub mod messages;
pub mod presence;

pub use status::*;
pub use diagnostics::*;
pub use messages::*;
pub use presence::*;
