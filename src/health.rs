use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let live_streams = state.live_streams();

    let status = if state.provider.is_closed() { "shutting_down" } else { "healthy" };

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
        "media": {
            "provider": state.provider.name(),
            "protocol": state.provider.protocol(),
            "listen": config.media.bind_addr(),
            "path": config.media.path,
            "live_streams": live_streams,
            "echo": config.media.echo
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "active_sessions": state.sessions.active_session_count()
        },
        "memory": get_memory_info(),
        "system": get_system_status(config.performance.max_concurrent_streams, live_streams)
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

    let connections = state.provider.connections();
    let inbound_dropped: u64 = connections.iter().map(|c| c.inbound().dropped()).sum();
    let outbound_evicted: u64 = connections.iter().map(|c| c.outbound().evicted()).sum();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "streams": {
            "live": connections.len(),
            "inbound_chunks_dropped": inbound_dropped,
            "outbound_chunks_evicted": outbound_evicted,
            "sessions": state.sessions.get_sessions_summary()
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_streams": state.get_config().performance.max_concurrent_streams
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(max_streams: usize, live_streams: usize) -> serde_json::Value {
    let stream_usage = if max_streams > 0 {
        live_streams as f64 / max_streams as f64
    } else {
        0.0
    };

    let status = if stream_usage > 0.9 {
        "high_load"
    } else if stream_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "stream_usage_percent": (stream_usage * 100.0).round(),
        "max_streams": max_streams,
        "current_streams": live_streams,
        "load_warnings": if stream_usage > 0.8 {
            vec!["High stream usage - consider increasing max_concurrent_streams"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test as actix_test, App};

    #[actix_web::test]
    async fn test_health_check_reports_media_layer() {
        let state = AppState::from_config(AppConfig::default());
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["media"]["provider"], "twilio-media-streams");
        assert_eq!(body["media"]["live_streams"], 0);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(10, 2)["status"], "normal");
        assert_eq!(get_system_status(10, 8)["status"], "moderate_load");
        assert_eq!(get_system_status(10, 10)["status"], "high_load");
    }
}
