//! Build script for quicken-core
//!
//! Checks the toolchain before compilation:
//! - Minimum Rust version (let-else and `Option::is_some_and` need 1.70)
//! - Whether the target architecture can use Quicken tables

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match (rustc_version::version(), rustc_version::Version::parse("1.70.0")) {
        (Ok(found), Ok(minimum)) => {
            if found < minimum {
                panic!("quicken-core requires Rust {minimum} or newer, found {found}");
            }
        }
        _ => println!("cargo:warning=could not verify Rust version"),
    }

    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if !matches!(arch.as_str(), "aarch64" | "arm") {
        println!(
            "cargo:warning=target architecture {arch:?} has no Quicken table support; \
             only frame-pointer and DWARF-based unwinding are available"
        );
    }
}
