use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

use crate::Logging;

pub fn init_tracing(logging: Logging) {
    let (levelfilter, level) = match logging {
        Logging::None => (LevelFilter::OFF, Level::ERROR),
        Logging::Info => (LevelFilter::INFO, Level::INFO),
        Logging::Debug => (LevelFilter::DEBUG, Level::DEBUG),
        Logging::All => (LevelFilter::TRACE, Level::TRACE),
    };

    let filter =
        tracing_subscriber::filter::Targets::new().with_target("media_search_engine", level);

    let format = time::format_description::parse(
        "[year]-[month padding:zero]-[day padding:zero] [hour]:[minute]:[second]",
    )
    .expect("the time format is static and valid");
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);

    let custom_layer = fmt::layer()
        .with_target(false)
        .with_timer(OffsetTime::new(offset, format))
        .with_filter(levelfilter)
        .with_filter(filter);

    tracing_subscriber::registry().with(custom_layer).init();
}
