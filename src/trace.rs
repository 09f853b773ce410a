//! Thin wrappers around `tracing` so the rest of the crate can log
//! unconditionally; with the `layers` feature disabled these macros compile
//! away to nothing (see SPEC_FULL.md §A.3).

#![allow(unused_macros)]

macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::trace!($($arg)+);
    }
}

macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::debug!($($arg)+);
    }
}

macro_rules! info {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::info!($($arg)+);
    }
}

macro_rules! warn {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::warn!($($arg)+);
    }
}

macro_rules! error {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::error!($($arg)+);
    }
}

macro_rules! debug_span {
    ($($arg:tt)*) => {{
        #[cfg(feature = "layers")]
        let _span = tracing::debug_span!($($arg)*).entered();
    }}
}
