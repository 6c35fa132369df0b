use std::net::SocketAddr;

use crate::render::DEFAULT_CACHE_CAPACITY;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub data_dir: String,
	pub cache_capacity: usize,
}

impl Config {
	/// Reads `.env` (if present) and the process environment.
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		let port = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok());
		let bind = if let Some(p) = port { format!("127.0.0.1:{}", p) } else { std::env::var("HTTP_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()) };
		let bind: SocketAddr = bind.parse()?;
		let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
		let cache_capacity = match std::env::var("RENDER_CACHE_CAPACITY") {
			Ok(v) => v.parse()?,
			Err(_) => DEFAULT_CACHE_CAPACITY,
		};
		Ok(Self { bind, data_dir, cache_capacity })
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
			data_dir: DEFAULT_DATA_DIR.to_string(),
			cache_capacity: DEFAULT_CACHE_CAPACITY,
		}
	}
}
