//! Horizon command - show the requeue horizons the scheduler would compute

use crate::cli::args::HorizonArgs;
use crate::cli::output;
use crate::config::Config;
use crate::error::{CredsyncError, CredsyncResult};
use crate::horizon::{clamp_renewal_percent, renewal_start, HorizonCalculator};
use std::time::Duration;

/// Execute the horizon command
pub async fn execute(args: HorizonArgs, config: &Config) -> CredsyncResult<()> {
    if args.samples == 0 {
        return Err(CredsyncError::field("samples", "must be at least 1"));
    }

    let calculator = match args.seed {
        Some(seed) => HorizonCalculator::seeded(seed),
        None => HorizonCalculator::new(),
    };
    let duration = effective_duration(args.duration, config);

    if args.static_creds {
        output::section("Static credential rotation");
        output::key_value("ttl", &humantime::format_duration(duration).to_string());
        for _ in 0..args.samples {
            let horizon = calculator.static_horizon(duration);
            output::key_value("horizon", &format_ms(horizon));
        }
        return Ok(());
    }

    let requested = args
        .renewal_percent
        .unwrap_or(i32::from(config.scheduler.default_renewal_percent));
    let percent = clamp_renewal_percent(requested);

    output::section("Lease renewal");
    output::key_value("lease", &humantime::format_duration(duration).to_string());
    if percent != requested {
        output::key_value("renewal percent", &format!("{percent} (clamped from {requested})"));
    } else {
        output::key_value("renewal percent", &percent.to_string());
    }
    output::key_value("window opens", &format_ms(renewal_start(duration, percent)));
    for _ in 0..args.samples {
        let horizon = calculator.dynamic_horizon(duration, percent);
        output::key_value("horizon", &format_ms(horizon));
    }

    Ok(())
}

/// Zero-length leases are scheduled against the configured minimum
fn effective_duration(duration: Duration, config: &Config) -> Duration {
    if duration.is_zero() {
        config.scheduler.min_lease_horizon
    } else {
        duration
    }
}

fn format_ms(d: Duration) -> String {
    humantime::format_duration(Duration::from_millis(d.as_millis() as u64)).to_string()
}
