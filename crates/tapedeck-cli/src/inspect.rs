//! Snapshot summary for humans and scripts

use serde::Serialize;
use std::path::Path;
use tapedeck_core::{snapshot, Exchange, ResponseBody, Result, Snapshot};

#[derive(Debug, Serialize)]
struct ExchangeSummary {
    index: usize,
    method: String,
    path: String,
    status: u16,
    chunks: usize,
}

impl From<&Exchange> for ExchangeSummary {
    fn from(exchange: &Exchange) -> Self {
        Self {
            index: exchange.sequence_index,
            method: exchange.request.method.clone(),
            path: exchange.request.path.clone(),
            status: exchange.response.status,
            chunks: exchange.response.body.chunk_count(),
        }
    }
}

pub fn run(path: &Path, json_output: bool) -> Result<()> {
    let snapshot = snapshot::load(path)?;
    print!("{}", render(&snapshot, json_output)?);
    Ok(())
}

fn render(snapshot: &Snapshot, json_output: bool) -> Result<String> {
    let summaries: Vec<ExchangeSummary> = snapshot.exchanges.iter().map(Into::into).collect();

    if json_output {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&summaries)?));
    }

    let mut out = String::new();
    if let Some(suite) = &snapshot.context.suite {
        out.push_str(&format!("Suite: {suite}\n"));
    }
    if let Some(test) = &snapshot.context.test {
        out.push_str(&format!("Test: {test}\n"));
    }
    for (summary, exchange) in summaries.iter().zip(&snapshot.exchanges) {
        let body = match &exchange.response.body {
            ResponseBody::Empty => "empty".to_string(),
            ResponseBody::Full(_) => "full".to_string(),
            ResponseBody::Chunked(_) => format!("{} chunks", summary.chunks),
        };
        out.push_str(&format!(
            "#{:<3} {:<6} {:<40} {} ({})\n",
            summary.index, summary.method, summary.path, summary.status, body
        ));
    }
    out.push_str(&format!("{} exchange(s)\n", summaries.len()));
    Ok(out)
}
