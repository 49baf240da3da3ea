//! A tiny HTTP/1.1 client built on a single h1driver connection.
//!
//! Sends one request and prints the response. Use `--help` to see the options.

use std::time::Duration;

use bytes::Bytes;
use clap::{arg, value_parser, ArgAction};
use h1driver::conn::{Config, Connection, OwnerId};
use h1driver::transport::{HttpOptions, HttpTransport, Origin};
use h1driver::{Request, RequestBody, Response, ResponsePart};
use http::uri::Scheme;
use http::Uri;
use tokio::io::AsyncWriteExt as _;
use tracing::Level;
use tracing_subscriber::{
    filter::Targets, fmt::format::FmtSpan, layer::SubscriberExt as _,
    util::SubscriberInitExt as _, Layer as _,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = Targets::new()
        .with_target("h1driver", Level::TRACE)
        .with_target("hurl", Level::TRACE)
        .with_default(Level::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_filter(filter),
        )
        .init();

    let args = clap::Command::new("hurl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("HTTP/1.1 client over a single connection")
        .args([
            clap::Arg::new("uri").help("Target URI").required(true),
            arg!(-X --method [METHOD] "HTTP method to use").default_value("GET"),
            arg!(-d --body [BODY] "HTTP body to send"),
            arg!(-H --header [HEADER]... "HTTP headers to send"),
            arg!(--timeout [SECONDS] "Receive timeout in seconds")
                .default_value("30")
                .value_parser(value_parser!(u64).range(1..)),
            arg!(--keylog [PATH] "Write TLS secrets to this file"),
            clap::Arg::new("stream")
                .long("stream")
                .help("Send the body one line at a time")
                .action(ArgAction::SetTrue),
            clap::Arg::new("parts")
                .long("parts")
                .help("Print each response part as it arrives")
                .action(ArgAction::SetTrue),
        ])
        .get_matches();

    let uri: Uri = args
        .get_one::<String>("uri")
        .ok_or("uri argument must be present")?
        .parse()?;

    let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
    let host = uri.host().ok_or("uri must include a host")?.to_owned();
    let port = uri
        .port_u16()
        .unwrap_or(if scheme == Scheme::HTTPS { 443 } else { 80 });
    let origin = Origin::new(scheme, host, port);

    let method: http::Method = args
        .get_one::<String>("method")
        .map(String::as_str)
        .unwrap_or("GET")
        .parse()?;

    let mut request = Request::new(method, uri.path());
    if let Some(query) = uri.query() {
        request = request.with_query(query);
    }

    request = request.with_header(
        http::header::USER_AGENT,
        concat!("hurl ", env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).parse()?,
    );

    if let Some(headers) = args.get_many::<String>("header") {
        for header in headers {
            let (name, value) = header
                .split_once(':')
                .ok_or("headers must be given as NAME: VALUE")?;
            request = request.with_header(name.trim().parse()?, value.trim().parse()?);
        }
    }

    if let Some(body) = args.get_one::<String>("body") {
        request = if args.get_flag("stream") {
            let lines: Vec<Bytes> = body
                .split_inclusive('\n')
                .map(|line| Bytes::copy_from_slice(line.as_bytes()))
                .collect();
            request.with_body(RequestBody::stream(futures_util::stream::iter(lines)))
        } else {
            request.with_body(body.clone())
        };
    }

    let mut config = Config::default();
    if let Some(path) = args.get_one::<String>("keylog") {
        config = config.with_ssl_key_log_file(path.as_str());
    }

    let timeout = Duration::from_secs(*args.get_one::<u64>("timeout").unwrap_or(&30));

    let mut conn = Connection::new(
        HttpTransport::new(),
        origin,
        HttpOptions::default(),
        OwnerId::new(),
    )
    .with_config(config);

    conn.connect().await?;
    let idle = conn.idle_time();

    if args.get_flag("parts") {
        let count = conn
            .request(
                request,
                0usize,
                |part, count| {
                    match part {
                        ResponsePart::Status(status) => println!("status: {status}"),
                        ResponsePart::Headers(headers) => {
                            for (name, value) in headers {
                                println!("header: {name}: {value:?}");
                            }
                        }
                        ResponsePart::Data(data) => println!("data: {} bytes", data.len()),
                    }
                    count + 1
                },
                timeout,
                idle,
            )
            .await?;
        println!("{count} parts");
    } else {
        let response = conn
            .request(request, Response::new(), Response::fold, timeout, idle)
            .await?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(response.body()).await?;
        stdout.flush().await?;

        println!();
        println!(
            "Response: {:?} {} bytes",
            response.status(),
            response.body().len()
        );
    }

    conn.close().await;
    Ok(())
}
