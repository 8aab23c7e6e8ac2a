pub mod history;
pub mod relay;
pub mod run;
