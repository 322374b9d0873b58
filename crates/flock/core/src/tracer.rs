use std::env;

use tracing::{dispatcher, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

const KEY: &str = "RUST_LOG";

fn init_layer_env_filter<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    EnvFilter::from_default_env()
}

fn init_layer_stdfmt<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    // progress goes to stderr; stdout is reserved for deployment results
    ::tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(::std::io::stderr)
}

#[cfg(feature = "otlp")]
fn init_layer_otlp_tracer<S>() -> Option<impl Layer<S>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    use opentelemetry_otlp as otlp;
    use opentelemetry_sdk::runtime::Tokio as Runtime;

    // Set default service name
    const SERVICE_NAME_KEY: &str = "OTEL_SERVICE_NAME";
    if env::var_os(SERVICE_NAME_KEY).is_none() {
        env::set_var(SERVICE_NAME_KEY, env!("CARGO_CRATE_NAME"));
    }

    match otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp::new_exporter().tonic())
        .install_batch(Runtime)
    {
        Ok(tracer) => Some(::tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(error) => {
            eprintln!("failed to init an OTLP tracer; spans will not be exported: {error}");
            None
        }
    }
}

fn init_subscriber() {
    let layer = Registry::default()
        .with(init_layer_env_filter())
        .with(init_layer_stdfmt());

    #[cfg(feature = "otlp")]
    let layer = layer.with(init_layer_otlp_tracer());

    layer.try_init().ok();
}

pub fn init_once() {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // set default tracing level
    if env::var_os(KEY).is_none() {
        env::set_var(KEY, "INFO");
    }

    init_subscriber()
}

pub fn init_once_with_level_int(level: u8) {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // You can see how many times a particular flag or argument occurred
    // Note, only flags can have multiple occurrences
    let debug_level = match level {
        0 => "WARN",
        1 => "INFO",
        2 => "DEBUG",
        _ => "TRACE",
    };
    env::set_var(KEY, debug_level);

    init_subscriber()
}

pub fn shutdown() {
    #[cfg(feature = "otlp")]
    ::opentelemetry::global::shutdown_tracer_provider();
}
