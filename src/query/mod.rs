pub mod history;
pub mod period;
