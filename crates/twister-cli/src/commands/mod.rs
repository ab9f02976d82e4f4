pub mod create;
pub mod deploy;
pub mod generate;
pub mod lint;
pub mod logs;
pub mod priority;
