//! Built-in smoke tests.
//!
//! These exercise every part of the orchestrator against any backend and
//! double as the native-function table of `convoy-agent`, which looks up
//! functions in the same registry.

use std::time::Duration;

use anyhow::{Context, bail};

use crate::harness::TestFnResult;
use crate::orchestrator::TestCluster;
use crate::platform::local::BOOT_CONFIG;
use crate::registry::{NativeFunc, Registry, RegistryError, TestDescriptor, Version};
use crate::worker::WorkerGroup;

/// A registry holding every built-in test.
pub fn builtin() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

pub fn register_builtin(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        TestDescriptor::new("basic.ssh", ssh_echo)
            .with_description("Every machine answers a remote command")
            .with_cluster_size(1),
    )?;

    registry.register(
        TestDescriptor::new("basic.os-release", os_release)
            .with_description("The image reports a parseable VERSION_ID")
            .with_cluster_size(1),
    )?;

    registry.register(
        TestDescriptor::new("basic.native", run_all_native)
            .with_description("Native functions run inside the payload binary")
            .with_cluster_size(1)
            .with_native("WorkdirWritable", NativeFunc::new(workdir_writable))
            .with_native("PathSet", NativeFunc::new(path_set))
            .with_native(
                "ProcMounted",
                NativeFunc::new(proc_mounted).excluding(["freebsd"]),
            ),
    )?;

    registry.register(
        TestDescriptor::new("basic.fanout", fanout)
            .with_description("Concurrent commands across a three-machine cluster")
            .with_cluster_size(3)
            .with_timeout(Duration::from_secs(600)),
    )?;

    registry.register(
        TestDescriptor::new("basic.discovery", discovery)
            .with_description("Boot configs share a discovery token and get unique names")
            .with_cluster_size(2)
            .with_platforms(["local"])
            .with_user_data("discovery=$discovery\nname=$name\nip=$private_ipv4\n"),
    )?;

    registry.register(
        TestDescriptor::new("basic.manual.sleep", sleep)
            .with_description("Holds a machine for a while; run by name only")
            .with_cluster_size(1)
            .manual(),
    )?;

    Ok(())
}

async fn ssh_echo(c: TestCluster) -> TestFnResult {
    for m in c.machines() {
        let out = c.must_ssh(&m, "echo hello").await?;
        if out != "hello" {
            return Err(c.fatal(format!("unexpected output from {}: {out:?}", m.id())));
        }
    }
    Ok(())
}

async fn os_release(c: TestCluster) -> TestFnResult {
    let Some(m) = c.machines().into_iter().next() else {
        return Err(c.fatal("no machines"));
    };
    let out = c
        .ssh(&m, "grep ^VERSION_ID= /etc/os-release")
        .await
        .map_err(|e| c.fatal(e.to_string()))?;
    if !out.success() {
        return Err(c.skip("image has no VERSION_ID"));
    }
    let version = Version::from_os_release(out.stdout.trim()).map_err(|e| c.fatal(e.to_string()))?;
    c.log(format!("VERSION_ID is {version}"));
    Ok(())
}

async fn run_all_native(c: TestCluster) -> TestFnResult {
    for m in c.machines() {
        for func in c.native_funcs() {
            c.run_native(&func, &m).await;
        }
    }
    Ok(())
}

fn workdir_writable() -> anyhow::Result<()> {
    let path = std::env::current_dir()?.join(".convoy-scratch");
    std::fs::write(&path, "ok").context("writing scratch file")?;
    let back = std::fs::read_to_string(&path)?;
    std::fs::remove_file(&path)?;
    if back != "ok" {
        bail!("scratch file read back as {back:?}");
    }
    Ok(())
}

fn path_set() -> anyhow::Result<()> {
    match std::env::var_os("PATH") {
        Some(p) if !p.is_empty() => Ok(()),
        _ => bail!("PATH is not set"),
    }
}

fn proc_mounted() -> anyhow::Result<()> {
    let stat = std::fs::read_to_string("/proc/self/stat").context("reading /proc/self/stat")?;
    if stat.trim().is_empty() {
        bail!("/proc/self/stat is empty");
    }
    Ok(())
}

async fn fanout(c: TestCluster) -> TestFnResult {
    let machines = c.machines();
    if machines.len() < 3 {
        return Err(c.fatal(format!("expected 3 machines, got {}", machines.len())));
    }

    let mut group = WorkerGroup::new(&c.token(), 2);
    for m in machines {
        let log = c.clone();
        let started = group
            .start(move |token| async move {
                let out = tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    out = m.ssh("uname -n") => out?,
                };
                if !out.success() {
                    bail!("uname on {} exited with {}", m.id(), out.exit_code);
                }
                log.log(format!("{}: {}", m.id(), out.stdout.trim()));
                Ok(())
            })
            .await;
        if let Err(e) = started {
            return group
                .wait_error(e)
                .await
                .map_err(|e| c.fatal(format!("fan-out failed: {e}")));
        }
    }
    group
        .wait()
        .await
        .map_err(|e| c.fatal(format!("fan-out failed: {e}")))
}

async fn discovery(c: TestCluster) -> TestFnResult {
    let mut tokens = Vec::new();
    let mut names = Vec::new();
    for m in c.machines() {
        let conf = c.must_ssh(&m, &format!("cat {BOOT_CONFIG}")).await?;
        for line in conf.lines() {
            if let Some(v) = line.strip_prefix("discovery=") {
                tokens.push(v.to_string());
            } else if let Some(v) = line.strip_prefix("name=") {
                names.push(v.to_string());
            } else if line.starts_with("ip=") && line != "ip=$private_ipv4" {
                c.error(format!("metadata placeholder was substituted: {line}"));
            }
        }
    }

    if tokens.is_empty() || tokens.iter().any(|t| t != &tokens[0] || t.contains('$')) {
        return Err(c.fatal(format!("discovery tokens differ or are missing: {tokens:?}")));
    }
    names.sort();
    names.dedup();
    if names.len() != c.machines().len() {
        return Err(c.fatal(format!("instance names are not unique: {names:?}")));
    }
    Ok(())
}

async fn sleep(c: TestCluster) -> TestFnResult {
    let machines = c.machines();
    let Some(m) = machines.first() else {
        return Err(c.fatal("no machines"));
    };
    c.must_ssh(m, "sleep 1").await?;
    Ok(())
}

/// Looks up native function `func` of test `test`.
pub fn native(registry: &Registry, test: &str, func: &str) -> Option<NativeFunc> {
    registry
        .get(test)
        .and_then(|d| d.native_func(func))
        .cloned()
}
