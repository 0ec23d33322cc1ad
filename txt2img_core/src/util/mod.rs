mod progress;

pub use progress::NiceProgressBar;
