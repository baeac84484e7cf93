mod app;
mod assignment;
mod config;
mod contacts;
mod content;
mod conversations;
mod error;
mod logging;
mod media;
mod outbound;
mod pipeline;
mod provider;
mod signature;
mod status;
mod store;
mod templating;
mod types;
mod webhook;

#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() {
    app::run().await;
}
