//
// main.rs
// dicom2mesh
//
// Binary entry point: installs the log subscriber and hands execution
// to the CLI layer.
//

use dicom2mesh::cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    cli::run()
}
