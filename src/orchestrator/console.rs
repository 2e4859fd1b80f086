//! Post-test scan of machine console logs.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::warn;

use crate::harness::H;
use crate::platform::Cluster;
use crate::registry::{Flag, TestDescriptor};

struct ConsoleCheck {
    desc: &'static str,
    pattern: Regex,
    skip_flag: Option<Flag>,
}

fn check(desc: &'static str, pattern: &str, skip_flag: Option<Flag>) -> ConsoleCheck {
    ConsoleCheck {
        desc,
        pattern: Regex::new(pattern).expect("static console pattern"),
        skip_flag,
    }
}

static CHECKS: LazyLock<Vec<ConsoleCheck>> = LazyLock::new(|| {
    vec![
        check("kernel panic", r"Kernel panic - not syncing: (.*)", None),
        check("kernel BUG", r"kernel BUG at (.*)", None),
        check("kernel oops", r"Oops:", None),
        check("soft lockup", r"watchdog: BUG: soft lockup", None),
        check(
            "emergency shell",
            r"You are in emergency mode|Entering emergency mode",
            Some(Flag::NoEmergencyShellCheck),
        ),
        check("dracut fatal", r"dracut: FATAL: (.*)", None),
        check("segfault", r"segfault at [0-9a-f]+ ip", None),
    ]
});

/// Returns a description of every problem found in `text`, in check order.
pub fn scan(text: &str, flags: &[Flag]) -> Vec<String> {
    CHECKS
        .iter()
        .filter(|c| c.skip_flag.is_none_or(|f| !flags.contains(&f)))
        .filter_map(|c| {
            c.pattern.captures(text).map(|caps| match caps.get(1) {
                Some(detail) => format!("{}: {}", c.desc, detail.as_str().trim()),
                None => c.desc.to_string(),
            })
        })
        .collect()
}

/// Saves each machine's console under the test's output directory and fails
/// the test for every problem found.
pub async fn check_consoles(h: &H, cluster: &Arc<dyn Cluster>, desc: &TestDescriptor) {
    for m in cluster.machines() {
        let console = match m.console_output().await {
            Ok(c) => c,
            Err(e) => {
                warn!(machine = %m.id(), error = %e, "Failed to read console");
                continue;
            }
        };
        if console.is_empty() {
            continue;
        }

        match h.output_dir() {
            Ok(dir) => {
                let path = dir.join(format!("console-{}.txt", m.id()));
                if let Err(e) = tokio::fs::write(&path, &console).await {
                    warn!(path = %path.display(), error = %e, "Failed to save console");
                }
            }
            Err(e) => warn!(error = %e, "No output directory for console"),
        }

        for problem in scan(&console, &desc.flags) {
            h.error(format!("Found {} on machine {} console", problem, m.id()));
        }
    }
}
