use anyhow::Error;
use bytes::Bytes;
use http::Response;
use hyper::body::HttpBody as _;
use hyper::Body;
use tokio::io::AsyncWriteExt;

pub(super) async fn dump_body_bytes(response: &mut Response<Body>) -> Result<Bytes, Error> {
    let mut buffer = Vec::default();
    while let Some(chunk) = response.body_mut().data().await {
        buffer.write_all(&chunk?).await?;
    }
    Ok(Bytes::from(buffer))
}

pub(super) async fn dump_body_to_string(response: &mut Response<Body>) -> Result<String, Error> {
    let buffer = dump_body_bytes(response).await?;
    Ok(std::str::from_utf8(&buffer)?.to_string())
}
