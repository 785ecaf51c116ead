mod field;
mod scanner;

pub use field::{BoundValue, FieldBinding, FieldSnapshot};
pub use scanner::ScannerController;
