//! h1driver
//!
//! A single HTTP/1.1 connection: its lifecycle (connect, reuse, idle tracking and
//! teardown) and one request/response exchange at a time over it, with the
//! response folded into a caller-supplied accumulator.
//!
//! ```no_run
//! # async fn demo() -> Result<(), h1driver::Error> {
//! use std::time::Duration;
//!
//! use h1driver::conn::{Connection, OwnerId};
//! use h1driver::transport::{HttpOptions, HttpTransport, Origin};
//! use h1driver::{Request, Response};
//!
//! let origin = Origin::new(http::uri::Scheme::HTTP, "example.com", 80);
//! let mut conn = Connection::new(
//!     HttpTransport::new(),
//!     origin,
//!     HttpOptions::default(),
//!     OwnerId::new(),
//! );
//!
//! conn.connect().await?;
//! let idle = conn.idle_time();
//! let response = conn
//!     .request(
//!         Request::get("/"),
//!         Response::new(),
//!         Response::fold,
//!         Duration::from_secs(5),
//!         idle,
//!     )
//!     .await?;
//! println!("{:?}", response.status());
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod conn;
mod error;
pub mod keylog;
mod request;
mod response;
pub mod telemetry;
pub mod transport;

pub use self::conn::Connection;
pub use self::error::{BoxError, Error};
pub use self::request::{Request, RequestBody};
pub use self::response::{Response, ResponsePart};
