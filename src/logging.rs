use time::UtcOffset;
use tracing_subscriber::{
    fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::{errors::InitializationError, ModbeeConfig, ModbeeError};

pub fn setup_logging(config: &ModbeeConfig) -> Result<(), ModbeeError> {
    let timer = OffsetTime::new(
        UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        time::format_description::well_known::Rfc3339,
    );

    // Determine base level filter
    let base_level = config.logging.get_level_filter();

    // Build the EnvFilter
    let mut env_filter = EnvFilter::default().add_directive(base_level.into());

    // If trace_frames is enabled, add more specific filtering
    if config.logging.trace_frames {
        env_filter = env_filter
            .add_directive("modbee::io=trace".parse().unwrap())
            .add_directive("modbee::protocol=trace".parse().unwrap());
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(config.logging.include_location)
        .with_line_number(config.logging.include_location)
        .with_level(true)
        .with_timer(timer.clone())
        .with_filter(env_filter);

    let file_layer = if config.logging.log_to_file {
        let writer = tracing_appender::rolling::daily(&config.logging.log_dir, "modbee.log");
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_timer(timer)
                .with_writer(writer)
                .with_filter(config.logging.get_level_filter()),
        )
    } else {
        None
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            ModbeeError::Init(InitializationError::logging(format!(
                "Failed to initialize logging: {}",
                e
            )))
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use crate::LoggingConfig;

    #[test]
    fn test_level_filter() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(config.get_level_filter(), LevelFilter::DEBUG);

        let config = LoggingConfig {
            level: "invalid".to_string(),
            ..Default::default()
        };
        assert_eq!(config.get_level_filter(), LevelFilter::INFO); // fallback
    }
}
