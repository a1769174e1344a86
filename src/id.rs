use std::sync::Mutex;

use once_cell::sync::Lazy;

static GENERATOR: Lazy<Mutex<ulid::Generator>> = Lazy::new(|| Mutex::new(ulid::Generator::new()));

/// Monotonic, lexicographically sortable id prefixed with the entity kind,
/// e.g. `task_01HXYZ...`.
pub fn generate(prefix: &str) -> String {
    let mut generator = GENERATOR.lock().expect("Failed to unwrap ulid generator.");
    let id = generator
        .generate()
        .expect("Failed to generate non-overflowing ulid somehow.");

    format!("{prefix}_{id}")
}
