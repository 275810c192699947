use color_eyre::eyre::Result;

/// Re-exported so binaries don't need their own dependency on `color_eyre`
/// just to name the return type of a fallible setup function.
pub use color_eyre::eyre::WrapErr;

/// Installs `color_eyre`'s panic and error report hooks. Call once, at
/// process start, before any fallible setup runs.
pub fn install() -> Result<()> {
    color_eyre::install()
}
