mod executor;
mod shutdown;

pub mod prelude {
    pub use crate::executor::Executor;
    pub use crate::shutdown::{CancelledError, DelegatedShutdownListener, ShutdownHandle};
}
