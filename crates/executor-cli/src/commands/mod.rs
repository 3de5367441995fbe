pub mod check;
pub mod cleanup;
pub mod config;
pub mod run;

pub use check::run as check;
pub use cleanup::run as cleanup;
pub use config::run as config;
pub use run::run;
