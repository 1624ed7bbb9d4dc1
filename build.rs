// Build script to compile GLSL compute shaders to SPIR-V

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile shaders using glslc (part of Vulkan SDK)
    compile_shader(
        "shaders/gaussian_filter.comp",
        "shaders/gaussian_filter.comp.spv",
    );
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // 8-bit storage needs at least a Vulkan 1.1 target
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.1")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input);
            eprintln!("Install Vulkan SDK or compile manually:");
            eprintln!("  glslc --target-env=vulkan1.1 {} -o {}", input, output);
        }
    }
}
