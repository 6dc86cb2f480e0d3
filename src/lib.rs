pub mod answer;
pub mod config;
pub mod directory;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod migration;
pub mod server;
pub mod signin;

#[cfg(test)]
mod testing;

// Test-only printing helper: expands to eprintln! during tests and debug builds and is a
// no-op otherwise.
// Usage: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In non-test builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}
