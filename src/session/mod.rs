mod machine;
mod state;
#[cfg(test)]
mod tests;

pub use machine::ScanSession;
pub use state::ScanState;
