use anyhow::{Context, Result, bail};

fn client(api_key: Option<&str>) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(key) = api_key {
        headers.insert(
            reqwest::header::HeaderName::from_static("x-api-key"),
            reqwest::header::HeaderValue::from_str(key).context("invalid api key value")?,
        );
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("failed to build HTTP client")
}

pub async fn status(addr: &str, api_key: Option<&str>) -> Result<()> {
    let response = client(api_key)?
        .get(format!("{addr}/admin/status"))
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let endpoints = body
                .get("endpoints")
                .cloned()
                .unwrap_or_else(|| serde_json::json!([]));
            let sessions = body.get("sessions").and_then(|v| v.as_u64()).unwrap_or(0);
            let pooled = body
                .get("pooledClients")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            println!(
                "metamcp gateway is running at {addr} (endpoints={endpoints}, sessions={sessions}, pooledClients={pooled})"
            );
        }
        Ok(response) => {
            println!(
                "metamcp gateway at {addr} responded with {}",
                response.status()
            );
        }
        Err(_) => {
            println!("metamcp gateway is not running at {addr}");
        }
    }

    Ok(())
}

pub async fn retry_container(addr: &str, server_uuid: &str, api_key: Option<&str>) -> Result<()> {
    let response = client(api_key)?
        .post(format!("{addr}/admin/servers/{server_uuid}/retry"))
        .send()
        .await
        .with_context(|| format!("failed to reach gateway at {addr}"))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if !status.is_success() {
        bail!(
            "retry failed ({status}): {}",
            body.get("error").and_then(|e| e.as_str()).unwrap_or("unknown error")
        );
    }

    match body.get("url").and_then(|url| url.as_str()) {
        Some(url) => println!("container recreated, gateway dials {url}"),
        None => println!("container recreated"),
    }
    Ok(())
}

pub async fn tail_logs(
    addr: &str,
    server_uuid: &str,
    n: usize,
    api_key: Option<&str>,
) -> Result<()> {
    let response = client(api_key)?
        .get(format!("{addr}/admin/servers/{server_uuid}/logs?n={n}"))
        .send()
        .await
        .with_context(|| format!("failed to reach gateway at {addr}"))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if !status.is_success() {
        bail!(
            "log fetch failed ({status}): {}",
            body.get("error").and_then(|e| e.as_str()).unwrap_or("unknown error")
        );
    }

    if let Some(lines) = body.get("lines").and_then(|lines| lines.as_array()) {
        for line in lines {
            if let Some(text) = line.as_str() {
                println!("{text}");
            }
        }
    }
    Ok(())
}
