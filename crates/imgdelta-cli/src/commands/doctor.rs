use super::{json_pretty, CommandResult, Context, EXIT_FAILURE, EXIT_SUCCESS};
use console::style;
use imgdelta_schema::DriverKind;
use imgdelta_store::{RecordStore, StoreLayout, StoreLock};
use serde::Serialize;
use std::path::Path;

pub fn run(ctx: &Context) -> CommandResult {
    let mut checks: Vec<Check> = Vec::new();

    check_driver(&ctx.driver(), &mut checks);
    check_tools(ctx, &mut checks);

    let layout = StoreLayout::new(&ctx.store_root);
    if layout.is_initialized() {
        checks.push(Check::pass("store_exists", "Store directory exists"));
        check_store(&layout, &mut checks);
        check_disk_space(&ctx.store_root, &mut checks);
    } else {
        checks.push(Check::info(
            "store_exists",
            "Store not initialized (will be created on first import or apply)",
        ));
    }

    let healthy = checks.iter().all(|c| c.status != Status::Fail);
    print_results(&checks, healthy, ctx.json)?;
    Ok(if healthy { EXIT_SUCCESS } else { EXIT_FAILURE })
}

fn check_driver(driver: &DriverKind, checks: &mut Vec<Check>) {
    match driver {
        DriverKind::Unsupported(name) => checks.push(Check::fail(
            "driver",
            &format!("Storage driver '{name}' cannot serve as an apply baseline"),
        )),
        known => checks.push(Check::pass("driver", &format!("Storage driver: {known}"))),
    }
}

fn check_tools(ctx: &Context, checks: &mut Vec<Check>) {
    let missing = imgdelta_runtime::check_prereqs(&ctx.config.tools, &ctx.driver());
    if missing.is_empty() {
        checks.push(Check::pass("tools", "External tools available"));
    } else {
        checks.push(Check::fail(
            "tools",
            &imgdelta_runtime::format_missing(&missing),
        ));
    }
}

fn check_store(layout: &StoreLayout, checks: &mut Vec<Check>) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("store_version", "Store format version valid")),
        Err(e) => {
            checks.push(Check::fail(
                "store_version",
                &format!("Store version check failed: {e}"),
            ));
            return;
        }
    }

    match imgdelta_store::verify_store_integrity(layout) {
        Ok(report) if report.is_clean() => checks.push(Check::pass(
            "store_integrity",
            &format!(
                "Store integrity OK ({} records, {} layers checked)",
                report.records_checked, report.layers_checked
            ),
        )),
        Ok(report) => {
            let mut message = format!(
                "{} integrity failures in {} records",
                report.failed.len(),
                report.records_checked
            );
            for failure in &report.failed {
                message.push_str(&format!("\n      {}: {}", failure.id, failure.reason));
            }
            checks.push(Check::fail("store_integrity", &message));
        }
        Err(e) => checks.push(Check::fail(
            "store_integrity",
            &format!("Integrity check failed: {e}"),
        )),
    }

    match StoreLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Store lock is free")),
        Ok(None) => checks.push(Check::warn(
            "store_lock",
            "Store lock is held by another process",
        )),
        Err(e) => checks.push(Check::fail(
            "store_lock",
            &format!("Cannot check store lock: {e}"),
        )),
    }

    match RecordStore::new(layout.clone()).list() {
        Ok(images) => checks.push(Check::info(
            "images",
            &format!("{} images in store", images.len()),
        )),
        Err(e) => checks.push(Check::warn("images", &format!("Cannot list images: {e}"))),
    }
}

fn print_results(checks: &[Check], healthy: bool, json_output: bool) -> Result<(), String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": healthy,
            "checks": checks,
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("imgdelta doctor\n");
        for check in checks {
            let icon = match check.status {
                Status::Pass => style("✓").green(),
                Status::Fail => style("✗").red().bold(),
                Status::Warn => style("⚠").yellow(),
                Status::Info => style("ℹ").dim(),
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if healthy {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct Check {
    name: String,
    status: Status,
    message: String,
}

impl Check {
    fn new(name: &str, status: Status, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, Status::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, Status::Fail, message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, Status::Warn, message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, Status::Info, message)
    }
}

fn check_disk_space(store_path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(store_path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: an all-zero statvfs is a valid value of the plain C struct.
    #[allow(unsafe_code)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is NUL-terminated and `stat` is a live, writable
    // struct; it is only read after the call reports success.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    let avail_mb = stat.f_bavail * stat.f_frsize / (1024 * 1024);
    if avail_mb < 100 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (deltas of large images may not fit)"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    }
}
