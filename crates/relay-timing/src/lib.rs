mod clock;
mod duration;
mod repeater;
mod ticks;

pub use clock::Clock;
pub use duration::Duration;
pub use repeater::Repeater;
pub use ticks::Ticks;
