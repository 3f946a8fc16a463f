//! Event Validator - decides which meters an event affects and whether the
//! event payload can be aggregated by each of them.

use serde_json::Value;

use crate::json_path::{JsonPath, PathError};
use crate::meter_cache::MeterSnapshot;
use crate::types::{Aggregation, Envelope, Meter, ProcessingStatus, SinkMessage};

/// A meter with its value and group-by paths parsed ahead of time.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMeter {
    pub meter: Meter,
    value_path: Option<JsonPath>,
    group_by: Vec<JsonPath>,
}

impl CompiledMeter {
    pub fn compile(meter: Meter) -> Result<Self, PathError> {
        let value_path = meter
            .value_property
            .as_deref()
            .map(JsonPath::parse)
            .transpose()?;
        let group_by = meter
            .group_by
            .values()
            .map(|path| JsonPath::parse(path))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            meter,
            value_path,
            group_by,
        })
    }
}

/// Result of checking one envelope against its namespace's meters.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub status: ProcessingStatus,
    pub affected_meters: Vec<Meter>,
}

/// Validate a decoded message against the snapshot and record the outcome on it.
///
/// A namespace that is not present in the snapshot at all drops the message,
/// since nothing could ever be aggregated from it.
pub fn validate_message(snapshot: &MeterSnapshot, message: &mut SinkMessage) {
    let Some(envelope) = message.envelope.as_ref() else {
        message.set_status(ProcessingStatus::drop("missing event envelope"));
        return;
    };

    let Some(meters) = snapshot.get_affected_meters(&message.namespace, &envelope.event_type)
    else {
        let reason = format!("namespace not found: {}", message.namespace);
        message.set_status(ProcessingStatus::drop(reason));
        return;
    };
    let validation = validate_event(meters, envelope);

    message.meters = validation.affected_meters;
    message.set_status(validation.status);
}

/// Check `envelope` against every meter with a matching event type.
///
/// Only the first failing meter's error is kept, but every matching meter
/// is reported as affected regardless of validity.
pub fn validate_event(meters: &[CompiledMeter], envelope: &Envelope) -> Validation {
    let mut affected_meters = Vec::new();
    let mut first_error: Option<String> = None;

    for compiled in meters
        .iter()
        .filter(|m| m.meter.event_type == envelope.event_type)
    {
        affected_meters.push(compiled.meter.clone());

        if first_error.is_none() {
            if let Err(e) = parse_event(compiled, &envelope.data) {
                first_error = Some(e);
            }
        }
    }

    let status = if affected_meters.is_empty() {
        ProcessingStatus::invalid(format!(
            "no meter found for event type: {}",
            envelope.event_type
        ))
    } else if let Some(error) = first_error {
        ProcessingStatus::invalid(error)
    } else {
        ProcessingStatus::Ok
    };

    Validation {
        status,
        affected_meters,
    }
}

/// Parse `data` the way `compiled` will aggregate it.
pub fn parse_event(compiled: &CompiledMeter, data: &str) -> Result<(), String> {
    let meter = &compiled.meter;
    if compiled.value_path.is_none() && meter.aggregation != Aggregation::Count {
        return Err(format!("meter {} has no value property", meter.slug));
    }

    if compiled.value_path.is_none() && compiled.group_by.is_empty() {
        // Plain COUNT: payload only needs to be JSON if it is there at all.
        if data.trim().is_empty() {
            return Ok(());
        }
        return serde_json::from_str::<Value>(data)
            .map(|_| ())
            .map_err(|e| format!("cannot unmarshal event data as json: {e}"));
    }

    let doc: Value =
        serde_json::from_str(data).map_err(|e| format!("cannot unmarshal event data as json: {e}"))?;
    if !doc.is_object() {
        return Err("event data must be a json object".to_string());
    }

    if let Some(path) = &compiled.value_path {
        let value = path
            .select(&doc)
            .ok_or_else(|| format!("missing value property: {:?}", path.as_str()))?;
        check_value(meter.aggregation, value)?;
    }

    for path in &compiled.group_by {
        if let Some(Value::Object(_) | Value::Array(_)) = path.select(&doc) {
            return Err(format!(
                "group by property must be a scalar: {:?}",
                path.as_str()
            ));
        }
    }

    Ok(())
}

fn check_value(aggregation: Aggregation, value: &Value) -> Result<(), String> {
    match (aggregation, value) {
        (_, Value::Null) => Err("value cannot be null".to_string()),
        (Aggregation::Count, _) => Ok(()),
        (Aggregation::UniqueCount, Value::String(_) | Value::Number(_)) => Ok(()),
        (Aggregation::UniqueCount, _) => {
            Err("value property must be a string or a number for unique count".to_string())
        }
        (_, Value::Number(_)) => Ok(()),
        (_, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|_| ())
            .map_err(|_| format!("value cannot be parsed as float64: {s:?}")),
        _ => Err("value cannot be parsed as float64".to_string()),
    }
}
