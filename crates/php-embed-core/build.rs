use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "libphp")]
    shim::build()?;

    Ok(())
}

/// Compiles the C shim in `shim/` against the headers of the PHP install
/// reported by `php-config` and links it with libphp.
#[cfg(feature = "libphp")]
mod shim {
    use std::env;
    use std::error::Error;
    use std::process::Command;

    const SOURCES: [&str; 4] = [
        "shim/engine.c",
        "shim/context.c",
        "shim/value.c",
        "shim/receiver.c",
    ];

    pub fn build() -> Result<(), Box<dyn Error>> {
        println!("cargo:rerun-if-changed=shim");
        println!("cargo:rerun-if-env-changed=PHP_CONFIG");
        println!("cargo:rerun-if-env-changed=PHP_LIB");

        let includes = php_config("--includes")?;
        let prefix = php_config("--prefix")?;
        let libs = php_config("--libs")?;

        let mut build = cc::Build::new();
        build.include("shim").files(SOURCES);
        for dir in includes.split_whitespace() {
            build.include(dir.trim_start_matches("-I"));
        }
        build.compile("php_embed_shim");

        let lib = env::var("PHP_LIB").unwrap_or_else(|_| "php".to_string());
        println!("cargo:rustc-link-search=native={}/lib", prefix.trim());
        println!("cargo:rustc-link-lib={lib}");
        for extra in libs.split_whitespace() {
            if let Some(name) = extra.strip_prefix("-l") {
                println!("cargo:rustc-link-lib={name}");
            }
        }
        Ok(())
    }

    fn php_config(flag: &str) -> Result<String, Box<dyn Error>> {
        let program = env::var("PHP_CONFIG").unwrap_or_else(|_| "php-config".to_string());
        let output = Command::new(&program)
            .arg(flag)
            .output()
            .map_err(|e| format!("failed to run {program} {flag}: {e}"))?;
        if !output.status.success() {
            return Err(format!("{program} {flag} exited with {}", output.status).into());
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}
