fn main() {
    let date = time_now();
    println!("cargo:rustc-env=BUILD_DATE={date}");

    // Release builds may embed OAuth client credentials from a .env file.
    // Variables already present in the environment win.
    load_dotenv();
}

fn load_dotenv() {
    let env_path = std::path::Path::new(".env");
    println!("cargo:rerun-if-changed=.env");
    let Ok(content) = std::fs::read_to_string(env_path) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.starts_with("DRIVESYNCD_") {
                continue;
            }
            if std::env::var(key).is_err() {
                println!("cargo:rustc-env={key}={}", value.trim());
            }
        }
    }
}

fn time_now() -> String {
    // SOURCE_DATE_EPOCH keeps builds reproducible
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        return run_date(&["-u", "-d", &format!("@{epoch}"), "+%Y-%m-%d"]);
    }
    run_date(&["-u", "+%Y-%m-%d"])
}

fn run_date(args: &[&str]) -> String {
    std::process::Command::new("date")
        .args(args)
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
