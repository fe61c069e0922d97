use std::env;
use std::error;

use reqwest::Url;

const DEFAULT_HEALTH_URL: &str = "http://127.0.0.1:7860/health";

/// Exits non-zero unless the video reasoner at the given URL answers with a 2xx status.
fn main() -> Result<(), Box<dyn error::Error>> {
    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_HEALTH_URL.to_string());
    let url = Url::parse(&url)?;

    let response = reqwest::blocking::get(url.clone())?;
    if !response.status().is_success() {
        return Err(format!("{url} answered with {}", response.status()).into());
    }

    Ok(())
}
