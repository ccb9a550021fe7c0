use chrono::{DateTime, Local};

pub fn get_version_info() -> String {
    format!("{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT_HASH"))
}

pub fn get_startup_banner() -> String {
    let build_timestamp: i64 = env!("BUILD_TIME").parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);
    format!(
        "voicebridge {} built {}",
        get_version_info(),
        build_datetime.format("%Y-%m-%d %H:%M:%S %Z")
    )
}
