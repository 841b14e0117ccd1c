use std::sync::Mutex;

use ulid::Generator;

/// Source of external reservation codes.
///
/// Codes must never repeat for the lifetime of the data directory. The engine
/// still checks every code against its index and treats a repeat as a
/// persistence fault.
pub trait CodeSource: Send + Sync {
    fn next_code(&self) -> String;
}

/// Monotonic ULIDs: unique across restarts and sortable by creation time.
pub struct UlidCodes {
    generator: Mutex<Generator>,
}

impl UlidCodes {
    pub fn new() -> Self {
        Self {
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl Default for UlidCodes {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeSource for UlidCodes {
    fn next_code(&self) -> String {
        let mut generator = match self.generator.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Overflow only happens after 2^80 codes in one millisecond.
        match generator.generate() {
            Ok(id) => id.to_string(),
            Err(_) => ulid::Ulid::new().to_string(),
        }
    }
}
