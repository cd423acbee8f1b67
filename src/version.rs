/// Release builds stamp `VIGIL_BUILD_VERSION`; local builds report the crate version.
pub const VERSION: &str = match option_env!("VIGIL_BUILD_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
