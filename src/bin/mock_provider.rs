//! Mock attendance provider
//!
//! Serves synthetic attendance data over HTTP for local runs of the engine.
//!
//! Endpoints:
//! - GET /attendance/changes?date=..&tenant=..[&version=..] -> {changed, version}
//! - GET /attendance/day?date=..&tenant=.. -> {version, records, zones}
//! - GET /health
//!
//! Behavior:
//! 1. The data advances one "generation" every `--change-every-secs`
//! 2. Each generation punches a few more users in and some users out
//! 3. Every fifth user punches in at the office itself, so markers collide
//! 4. A few records use the multi-cycle shape, one carries a garbage location
//!
//! Usage:
//!   cargo run --bin mock-provider -- --port 9090 --users 25 --change-every-secs 15

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Office location every synthetic user starts around
const OFFICE: (f64, f64) = (23.8103, 90.4125);

#[derive(Parser, Debug)]
#[command(name = "mock-provider")]
#[command(about = "Mock attendance provider for local simulation")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "9090")]
    port: u16,

    /// Number of synthetic users
    #[arg(short, long, default_value = "25")]
    users: usize,

    /// Seconds between data changes
    #[arg(long, default_value = "15")]
    change_every_secs: u64,
}

struct MockState {
    started: Instant,
    change_every: Duration,
    users: usize,
}

impl MockState {
    fn generation(&self) -> u64 {
        let step = self.change_every.as_secs().max(1);
        self.started.elapsed().as_secs() / step
    }
}

fn version_for(generation: u64) -> String {
    format!("g-{generation}")
}

/// Parse `a=1&b=2` into pairs; values are used verbatim
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

fn user_location(i: usize) -> String {
    if i % 5 == 0 {
        return format!("{},{}", OFFICE.0, OFFICE.1);
    }
    let lat = OFFICE.0 + (i as f64 * 0.0021) % 0.03;
    let lng = OFFICE.1 + (i as f64 * 0.0017) % 0.03;
    format!("{lat:.6},{lng:.6}")
}

fn clock(minutes_after_eight: usize) -> String {
    let total = 8 * 60 + minutes_after_eight;
    format!("{:02}:{:02}", (total / 60) % 24, total % 60)
}

/// Records visible at `generation`
fn build_records(users: usize, generation: u64) -> Vec<Value> {
    let generation = generation as usize;
    let punched_in = (generation * 3 + 3).min(users);
    let punched_out = generation.min(punched_in);

    (0..punched_in)
        .map(|i| {
            let user_id = format!("U{:03}", i + 1);
            let name = format!("Field User {}", i + 1);
            let in_time = clock(i * 4);
            let out = i < punched_out && i % 2 == 0;

            if i % 7 == 3 {
                // Multi-cycle shape: a finished morning cycle plus the current one
                let mut current = json!({
                    "punchin_location": user_location(i),
                    "punchin_time": clock(240 + i),
                    "is_complete": false
                });
                if out {
                    current["punchout_location"] = json!({"lat": OFFICE.0, "lng": OFFICE.1});
                    current["punchout_time"] = json!(clock(480 + i));
                    current["is_complete"] = json!(true);
                }
                return json!({
                    "user_id": user_id,
                    "name": name,
                    "cycles": [
                        {
                            "punchin_location": user_location(i),
                            "punchin_time": in_time,
                            "punchout_location": user_location(i + 1),
                            "punchout_time": clock(180 + i),
                            "is_complete": true
                        },
                        current
                    ]
                });
            }

            let location = if i % 11 == 10 { "unknown".to_string() } else { user_location(i) };
            let mut record = json!({
                "user_id": user_id,
                "name": name,
                "punchin_location": location,
                "punchin_time": in_time,
                "punchin_photo": format!("https://photos.example/{user_id}/in.jpg")
            });
            if out {
                record["punchout_location"] = json!(user_location(i + 2));
                record["punchout_time"] = json!(clock(480 + i * 2));
            }
            record
        })
        .collect()
}

fn build_zones() -> Vec<Value> {
    let (lat, lng) = OFFICE;
    vec![
        json!({
            "attendance_type": 1,
            "name": "Head Office",
            "type": "polygon",
            "points": [
                format!("{},{}", lat - 0.002, lng - 0.002),
                format!("{},{}", lat - 0.002, lng + 0.002),
                format!("{},{}", lat + 0.002, lng + 0.002),
                format!("{},{}", lat + 0.002, lng - 0.002)
            ]
        }),
        json!({
            "attendance_type": 2,
            "name": "Field Routes",
            "type": "route",
            "routes": [
                {
                    "name": "North",
                    "waypoints": [
                        {"lat": lat, "lng": lng},
                        {"lat": lat + 0.01, "lng": lng + 0.005},
                        {"lat": lat + 0.02, "lng": lng + 0.012}
                    ]
                },
                {
                    "name": "East",
                    "waypoints": [
                        format!("{lat},{lng}"),
                        format!("{},{}", lat + 0.003, lng + 0.02)
                    ]
                }
            ]
        }),
    ]
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let query = req.uri().query();
    let generation = state.generation();
    let version = version_for(generation);

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/attendance/changes") => {
            let known = query_param(query, "version");
            let changed = known != Some(version.as_str());
            if changed {
                println!(
                    "[MOCK] changes date={} tenant={} known={:?} -> {}",
                    query_param(query, "date").unwrap_or("-"),
                    query_param(query, "tenant").unwrap_or("-"),
                    known,
                    version
                );
            }
            json_response(StatusCode::OK, json!({ "changed": changed, "version": version }))
        }
        (&Method::GET, "/attendance/day") => {
            let records = build_records(state.users, generation);
            println!("[MOCK] day {} -> {} records", version, records.len());
            json_response(
                StatusCode::OK,
                json!({ "version": version, "records": records, "zones": build_zones() }),
            )
        }
        (&Method::GET, "/health") => json_response(StatusCode::OK, json!({ "ok": true })),
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not_found" })),
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║              Mock Attendance Provider                    ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║ Port:            {:>5}                                   ║", args.port);
    println!("║ Users:           {:>5}                                   ║", args.users);
    println!("║ Change every:    {:>5} s                                 ║", args.change_every_secs);
    println!("╚══════════════════════════════════════════════════════════╝");

    let state = Arc::new(MockState {
        started: Instant::now(),
        change_every: Duration::from_secs(args.change_every_secs),
        users: args.users,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("[MOCK] HTTP error: {}", e);
            }
        });
    }
}
