//! Admission strategies and the limiter that orchestrates them.

mod clock;
mod fixed_window;
mod limiter;
mod observer;
mod sliding_window;
mod strategy;
mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::FixedWindow;
pub use limiter::{Limiter, Snapshot};
pub use observer::{KeyedObserver, LimiterObserver, NoopObserver};
pub use sliding_window::SlidingWindow;
pub use strategy::{AdmissionStrategy, Algorithm, WindowState};
pub use token_bucket::TokenBucket;
