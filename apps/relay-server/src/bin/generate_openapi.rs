use utoipa::OpenApi;

fn main() {
    let spec = match relay_server::routes::ApiDoc::openapi().to_pretty_json() {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("failed to render OpenAPI document: {err}");
            std::process::exit(1);
        }
    };
    let out = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/relay-server.json");
    if let Some(parent) = out.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("failed to create {}: {err}", parent.display());
            std::process::exit(1);
        }
    }
    if let Err(err) = std::fs::write(&out, spec) {
        eprintln!("failed to write {}: {err}", out.display());
        std::process::exit(1);
    }
    println!("Wrote {}", out.display());
}
