//! `opcache check` and `opcache run`.

use std::io::{self, Write};
use std::path::PathBuf;

use opcache_cache::CacheInfo;
use opcache_config::{FilterSet, OpcacheConfig};
use opcache_runtime::{CacheService, CompileMode, LineCompiler, LiveEnvironment, Origin};
use serde_json::json;
use tracing::debug;

use crate::exec::Executor;
use crate::{GlobalArgs, ReportFormat, RunArgs};

/// Runs the `opcache check` command.
pub fn check(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = global.load_config()?;
    FilterSet::compile(&config.cache.filters)?;
    if !global.quiet {
        print_settings(&config);
    }
    Ok(0)
}

fn print_settings(config: &OpcacheConfig) {
    let cache = &config.cache;
    println!("cache.enabled          = {}", cache.enabled);
    println!("cache.shm_size         = {}", cache.shm_size);
    println!("cache.max_file_size    = {}", cache.max_file_size);
    println!("cache.ttl              = {}", cache.ttl);
    println!("cache.gc_ttl           = {}", cache.gc_ttl);
    println!("cache.stat             = {}", cache.stat);
    println!("cache.file_digest      = {}", cache.file_digest);
    println!("cache.filters          = {}", cache.filters.len());
    println!("cache.lock             = {}", cache.lock);
    println!("cache.write_lock       = {}", cache.write_lock);
    println!("install.lazy_functions = {}", config.install.lazy_functions);
    println!("install.lazy_classes   = {}", config.install.lazy_classes);
    println!("values.serializer      = {}", config.values.serializer);
}

/// One compile outcome, for the report.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Request number, starting at 1.
    pub request: usize,
    /// File as given on the command line.
    pub file: PathBuf,
    /// Cache outcome, or `None` if the compile failed.
    pub origin: Option<Origin>,
}

/// Runs the `opcache run` command.
///
/// Every request gets a fresh environment; files within a request share it,
/// as includes would. Program output goes to stdout, the report to stderr
/// (text) or stdout (JSON).
pub fn run(args: &RunArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = global.load_config()?;
    let mut service = CacheService::new(config, Box::new(LineCompiler))?;
    service.set_force_update(args.force_update);
    service.set_search_path(args.include_path.clone());

    let stdout = io::stdout();
    let (outcomes, failed) = simulate(&service, args, stdout.lock())?;

    let info = service.info();
    match args.format {
        ReportFormat::Text => {
            if !global.quiet {
                eprint!("{}", render_text(&outcomes, &info));
            }
        }
        ReportFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&render_json(&outcomes, &info))?);
        }
    }
    Ok(if failed { 1 } else { 0 })
}

/// Executes the requested files, writing program output to `out`.
/// Returns the outcomes and whether any compile or execution failed.
pub fn simulate<W: Write>(
    service: &CacheService,
    args: &RunArgs,
    mut out: W,
) -> io::Result<(Vec<Outcome>, bool)> {
    let mut outcomes = Vec::with_capacity(args.requests * args.files.len());
    let mut failed = false;

    for request in 1..=args.requests {
        let mut env = LiveEnvironment::new();
        let mut session = service.begin_request(&mut env);
        let mut exec = Executor::new(&mut session, &mut out);

        for file in &args.files {
            let compiled = match exec.session().compile_file(file, CompileMode::Include) {
                Ok(compiled) => compiled,
                Err(failure) => {
                    eprintln!("error: {failure}");
                    failed = true;
                    outcomes.push(Outcome {
                        request,
                        file: file.clone(),
                        origin: None,
                    });
                    continue;
                }
            };
            debug!(request, file = %file.display(), origin = %compiled.origin, "compiled");
            outcomes.push(Outcome {
                request,
                file: file.clone(),
                origin: Some(compiled.origin),
            });
            if let Err(e) = exec.run(&compiled.op_array) {
                eprintln!("error: {}: {e}", file.display());
                failed = true;
            }
        }
        drop(exec);
        drop(session);
        out.flush()?;
    }
    Ok((outcomes, failed))
}

fn render_text(outcomes: &[Outcome], info: &CacheInfo) -> String {
    let mut text = String::new();
    for o in outcomes {
        let origin = o.origin.map_or_else(|| "failed".to_string(), |x| x.to_string());
        text.push_str(&format!("#{} {} {}\n", o.request, o.file.display(), origin));
    }
    text.push_str(&format!(
        "{} entries, {} hits, {} misses, {} inserts, {} expunges, {} bytes used\n",
        info.entries.len(),
        info.hits,
        info.misses,
        info.inserts,
        info.expunges,
        info.mem_used
    ));
    text
}

fn render_json(outcomes: &[Outcome], info: &CacheInfo) -> serde_json::Value {
    let requests: Vec<_> = outcomes
        .iter()
        .map(|o| {
            json!({
                "request": o.request,
                "file": o.file.display().to_string(),
                "origin": o.origin.map(|x| x.to_string()),
            })
        })
        .collect();
    let entries: Vec<_> = info
        .entries
        .iter()
        .map(|e| {
            json!({
                "filename": e.filename.display().to_string(),
                "hits": e.hits,
                "ref_count": e.ref_count,
                "mem_size": e.mem_size,
                "created": e.created,
                "access_time": e.access_time,
            })
        })
        .collect();
    json!({
        "requests": requests,
        "cache": {
            "entries": entries,
            "hits": info.hits,
            "misses": info.misses,
            "inserts": info.inserts,
            "expunges": info.expunges,
            "mem_used": info.mem_used,
            "mem_capacity": info.mem_capacity,
            "pending_deletions": info.pending_deletions,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn service(dir: &Path) -> CacheService {
        let mut config = OpcacheConfig::default();
        config.cache.lock_path = dir.join("opcache.lock");
        config.cache.file_update_protection = 0;
        CacheService::new(config, Box::new(LineCompiler)).unwrap()
    }

    fn args(files: Vec<PathBuf>, requests: usize) -> RunArgs {
        RunArgs {
            files,
            requests,
            force_update: false,
            include_path: Vec::new(),
            format: ReportFormat::Text,
        }
    }

    #[test]
    fn repeated_requests_hit_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.src");
        let page = dir.path().join("page.src");
        std::fs::write(&lib, "function hello\n  echo \"hi\"\n").unwrap();
        std::fs::write(&page, "call hello\n").unwrap();
        let service = service(dir.path());

        let mut out = Vec::new();
        let (outcomes, failed) =
            simulate(&service, &args(vec![lib, page], 3), &mut out).unwrap();
        assert!(!failed);
        assert_eq!(String::from_utf8(out).unwrap(), "hihihi");
        let origins: Vec<_> = outcomes.iter().map(|o| o.origin).collect();
        assert_eq!(
            origins,
            vec![
                Some(Origin::Populated),
                Some(Origin::Populated),
                Some(Origin::Hit),
                Some(Origin::Hit),
                Some(Origin::Hit),
                Some(Origin::Hit),
            ]
        );

        let info = service.info();
        assert_eq!(info.entries.len(), 2);
        assert!(info.entries.iter().all(|e| e.ref_count == 0));
    }

    #[test]
    fn compile_failure_is_reported_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.src");
        std::fs::write(&good, "echo 1\n").unwrap();
        let service = service(dir.path());

        let mut out = Vec::new();
        let (outcomes, failed) = simulate(
            &service,
            &args(vec![dir.path().join("missing.src"), good], 1),
            &mut out,
        )
        .unwrap();
        assert!(failed);
        assert_eq!(outcomes[0].origin, None);
        assert_eq!(outcomes[1].origin, Some(Origin::Populated));
        assert_eq!(out, b"1");
    }

    #[test]
    fn json_report_lists_requests_and_entries() {
        let info = CacheInfo {
            entries: Vec::new(),
            hits: 2,
            misses: 1,
            inserts: 1,
            expunges: 0,
            mem_used: 128,
            mem_capacity: Some(1024),
            pending_deletions: 0,
        };
        let outcomes = vec![Outcome {
            request: 1,
            file: PathBuf::from("a.src"),
            origin: Some(Origin::Hit),
        }];
        let report = render_json(&outcomes, &info);
        assert_eq!(report["requests"][0]["origin"], "hit");
        assert_eq!(report["cache"]["hits"], 2);
        assert_eq!(report["cache"]["mem_capacity"], 1024);
    }

    #[test]
    fn text_report_marks_failures() {
        let info = CacheInfo {
            entries: Vec::new(),
            hits: 0,
            misses: 0,
            inserts: 0,
            expunges: 0,
            mem_used: 0,
            mem_capacity: None,
            pending_deletions: 0,
        };
        let outcomes = vec![Outcome {
            request: 1,
            file: PathBuf::from("a.src"),
            origin: None,
        }];
        let text = render_text(&outcomes, &info);
        assert!(text.starts_with("#1 a.src failed\n"));
    }
}
