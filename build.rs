use rerun_except::rerun_except;
use std::path::PathBuf;

const FEATURE_CHECKS_PATH: &str = "feature_checks";

/// Simple feature check, returning `true` if we have the feature.
///
/// The checks themselves are in files under `FEATURE_CHECKS_PATH`.
fn feature_check(filename: &str, output_file: &str) -> bool {
    let mut path = PathBuf::new();
    path.push(FEATURE_CHECKS_PATH);
    path.push(filename);

    let mut check_build = cc::Build::new();
    check_build.file(path).try_compile(output_file).is_ok()
}

fn main() {
    println!("cargo:rustc-check-cfg=cfg(opencsd)");

    // The decode engine needs libopencsd's C API. If the headers aren't
    // installed we still build, but constructing a real decoder reports
    // `EngineUnavailable`.
    #[cfg(target_os = "linux")]
    {
        if feature_check("check_opencsd.c", "check_opencsd") {
            let mut c_build = cc::Build::new();
            c_build.file("src/decode/opencsd_shim.c");
            c_build.compile("cstracer_csd");
            println!("cargo:rustc-cfg=opencsd");
            println!("cargo:rustc-link-lib=opencsd_c_api");
        }
    }

    // Additional circumstances under which to re-run this build.rs.
    rerun_except(&["README.md", "LICENSE-*", "COPYRIGHT", "DESIGN.md"]).unwrap();
}
