/// Extract the station identifier carried by an MQTT topic
///
/// Topics are `/`-delimited; `segment` is the zero-based position of the
/// identifier, so the default of `1` picks `SENSOR42` out of
/// `aqms/SENSOR42/data`.
///
/// # Returns
/// * `Some(&str)` - The trimmed, non-empty segment
/// * `None` - The topic is too short or the segment is blank
///
/// # Examples
/// ```
/// use ingestion_worker::domain::source_id_from_topic;
///
/// assert_eq!(source_id_from_topic("aqms/SENSOR42/data", 1), Some("SENSOR42"));
/// assert_eq!(source_id_from_topic("aqms", 1), None);
/// ```
pub fn source_id_from_topic(topic: &str, segment: usize) -> Option<&str> {
    topic
        .split('/')
        .nth(segment)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
