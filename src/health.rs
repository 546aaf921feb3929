use crate::config::AppConfig;
use crate::inference::ModelStatus;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// Liveness plus a summary of the classification pipeline.
///
/// Always answers 200: without a model the service keeps answering frames from
/// the fallback classifier, which is reported as `"degraded"`.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let model_status = state.pipeline.engine().status().await;
    let pipeline_metrics = state.pipeline.metrics().await;
    let live_sessions = state.pipeline.registry().len().await;

    let status = match model_status {
        ModelStatus::Unavailable { .. } => "degraded",
        _ => "healthy",
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "model": {
            "family": config.model.family,
            "source": config.model.hub_repo.as_deref().unwrap_or(&config.model.path),
            "state": model_status
        },
        "pipeline": {
            "frames_received": pipeline_metrics.frames_received,
            "model_results": pipeline_metrics.model_results,
            "fallback_results": pipeline_metrics.fallback_results,
            "decode_errors": pipeline_metrics.decode_errors
        },
        "connections": {
            "active": metrics.active_connections,
            "total": metrics.total_connections
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, live_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_connections": metrics.active_connections,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "pipeline": state.pipeline.metrics().await,
        "inference": state.pipeline.engine().metrics().await,
        "sessions": {
            "registered": state.pipeline.registry().len().await,
            "with_state": state.pipeline.store().len().await
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "pid": pid,
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(config: &AppConfig, live_sessions: usize) -> serde_json::Value {
    let max_sessions = config.sessions.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        live_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": live_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing sessions.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
