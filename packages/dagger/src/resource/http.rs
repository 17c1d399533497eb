//! HTTP resources (`http://` and `https://`).
//!
//! Writes accumulate a request body. The first read or flush sends the
//! request (GET without a body, POST with one) and later reads stream the
//! response body.

use std::io::{self, Read};

use reqwest::blocking::{Client, Response};
use url::Url;

use super::{closed, Resource};

pub struct HttpResource {
    url: Url,
    name: String,
    client: Option<Client>,
    body: Vec<u8>,
    response: Option<Response>,
    closed: bool,
}

impl HttpResource {
    pub fn new(url: Url) -> Self {
        Self {
            name: url.to_string(),
            url,
            client: None,
            body: Vec::new(),
            response: None,
            closed: false,
        }
    }

    /// Use a preconfigured client instead of building one on first send.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Whether the request has gone out.
    pub fn is_sent(&self) -> bool {
        self.response.is_some()
    }

    fn send(&mut self) -> io::Result<&mut Response> {
        if self.closed {
            return Err(closed(&self.name));
        }
        if self.response.is_none() {
            let client = self.client.get_or_insert_with(Client::new);
            let request = if self.body.is_empty() {
                client.get(self.url.clone())
            } else {
                client
                    .post(self.url.clone())
                    .body(std::mem::take(&mut self.body))
            };
            let response = request.send().map_err(io::Error::other)?;
            self.response = Some(response);
        }
        self.response
            .as_mut()
            .ok_or_else(|| io::Error::other("request was not sent"))
    }
}

impl Resource for HttpResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.send()?.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed(&self.name));
        }
        if self.response.is_some() {
            return Err(io::Error::other(format!(
                "{}: request already sent",
                self.name
            )));
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send().map(|_| ())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed(&self.name));
        }
        self.closed = true;
        self.response = None;
        self.client = None;
        self.body.clear();
        Ok(())
    }
}
