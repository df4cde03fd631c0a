/// Parameter-caching wrapper around a pump connection
///
/// Parameter setters are skipped when the same setter was already sent the same
/// value (per pump on multi-pump units). Run controls and readouts always go
/// through. The cache is cleared at the start of every program run and on
/// disconnect so the pump gets a fresh full parameter set.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

use crate::pump_connection::{PumpConnection, PumpMode, Units};

/// Methods whose arguments are cached
pub const CACHEABLE_METHODS: [&str; 8] = [
    "setUnits", "setDiameter", "setVolume", "setMode", "setRate", "setDelay", "setTime", "setPump",
];

/// Value-based representation of the arguments sent to a setter.
/// Lists compare as ordered tuples, maps as sorted key/value pairs.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Text(String),
    List(Vec<ParamValue>),
    Map(Vec<(String, ParamValue)>),
}

impl ParamValue {
    pub fn map(entries: BTreeMap<String, ParamValue>) -> Self {
        ParamValue::Map(entries.into_iter().collect())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self {
        ParamValue::Number(v as f64)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Cache of last-applied setter arguments
#[derive(Debug, Default, Clone)]
pub struct ParameterCache {
    entries: HashMap<String, ParamValue>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key: method name, suffixed with the pump number on multi-pump units
    pub fn key(method: &str, multipump: bool, current_pump: u8) -> String {
        if multipump {
            format!("{}_pump_{}", method, current_pump)
        } else {
            method.to_string()
        }
    }

    /// True when hardware must be invoked for `key` with `value`
    pub fn should_call(&self, key: &str, value: &ParamValue) -> bool {
        self.entries.get(key) != Some(value)
    }

    pub fn record(&mut self, key: String, value: ParamValue) {
        self.entries.insert(key, value);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decorator that suppresses redundant parameter writes
#[derive(Debug)]
pub struct CachedConnection<C: PumpConnection> {
    connection: C,
    cache: ParameterCache,
}

impl<C: PumpConnection> CachedConnection<C> {
    pub fn new(connection: C) -> Self {
        Self { connection, cache: ParameterCache::new() }
    }

    pub fn reset_cache(&mut self) {
        self.cache.clear();
        log::debug!(target: "cached_connection", "Connection cache reset");
    }

    pub fn cache(&self) -> &ParameterCache {
        &self.cache
    }

    pub fn inner(&self) -> &C {
        &self.connection
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn into_inner(self) -> C {
        self.connection
    }

    fn cached_call<F>(&mut self, method: &str, value: ParamValue, call: F) -> Result<()>
    where
        F: FnOnce(&mut C) -> Result<()>,
    {
        let key = ParameterCache::key(method, self.connection.multipump(), self.connection.current_pump());
        if !self.cache.should_call(&key, &value) {
            log::debug!(target: "cached_connection", "Cache hit for {}({:?}): parameter unchanged", method, value);
            return Ok(());
        }
        log::debug!(target: "cached_connection", "Cache miss for {}({:?}): calling hardware", method, value);
        call(&mut self.connection)?;
        self.cache.record(key, value);
        Ok(())
    }
}

impl<C: PumpConnection> PumpConnection for CachedConnection<C> {
    fn open_connection(&mut self) -> Result<()> {
        self.connection.open_connection()
    }

    fn close_connection(&mut self) -> Result<()> {
        self.connection.close_connection()
    }

    fn set_units(&mut self, units: Units) -> Result<()> {
        self.cached_call("setUnits", units.label().into(), |c| c.set_units(units))
    }

    fn set_diameter(&mut self, diameter: f64) -> Result<()> {
        self.cached_call("setDiameter", diameter.into(), |c| c.set_diameter(diameter))
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.cached_call("setVolume", volume.into(), |c| c.set_volume(volume))
    }

    fn set_mode(&mut self, mode: PumpMode) -> Result<()> {
        self.cached_call("setMode", mode.code().into(), |c| c.set_mode(mode))
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        self.cached_call("setRate", rate.into(), |c| c.set_rate(rate))
    }

    fn set_delay(&mut self, delay: f64) -> Result<()> {
        self.cached_call("setDelay", delay.into(), |c| c.set_delay(delay))
    }

    fn set_time(&mut self, time: f64) -> Result<()> {
        self.cached_call("setTime", time.into(), |c| c.set_time(time))
    }

    fn set_pump(&mut self, pump: u8) -> Result<()> {
        self.cached_call("setPump", pump.into(), |c| c.set_pump(pump))
    }

    fn start_pump(&mut self) -> Result<()> {
        self.connection.start_pump()
    }

    fn stop_pump(&mut self) -> Result<()> {
        self.connection.stop_pump()
    }

    fn pause_pump(&mut self) -> Result<()> {
        self.connection.pause_pump()
    }

    fn get_parameters(&mut self) -> Result<Vec<String>> {
        self.connection.get_parameters()
    }

    fn multipump(&self) -> bool {
        self.connection.multipump()
    }

    fn current_pump(&self) -> u8 {
        self.connection.current_pump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[derive(Default)]
    struct CountingPump {
        calls: Vec<String>,
        multipump: bool,
        pump: u8,
        fail_rate: bool,
    }

    impl PumpConnection for CountingPump {
        fn open_connection(&mut self) -> Result<()> { Ok(()) }
        fn close_connection(&mut self) -> Result<()> { Ok(()) }
        fn set_units(&mut self, u: Units) -> Result<()> { self.calls.push(format!("units {}", u)); Ok(()) }
        fn set_diameter(&mut self, d: f64) -> Result<()> { self.calls.push(format!("diameter {}", d)); Ok(()) }
        fn set_volume(&mut self, v: f64) -> Result<()> { self.calls.push(format!("volume {}", v)); Ok(()) }
        fn set_mode(&mut self, m: PumpMode) -> Result<()> { self.calls.push(format!("mode {}", m.code())); Ok(()) }
        fn set_rate(&mut self, r: f64) -> Result<()> {
            if self.fail_rate {
                return Err(anyhow!("rate rejected"));
            }
            self.calls.push(format!("rate {}", r));
            Ok(())
        }
        fn set_delay(&mut self, d: f64) -> Result<()> { self.calls.push(format!("delay {}", d)); Ok(()) }
        fn set_time(&mut self, t: f64) -> Result<()> { self.calls.push(format!("time {}", t)); Ok(()) }
        fn set_pump(&mut self, p: u8) -> Result<()> { self.pump = p; self.calls.push(format!("pump {}", p)); Ok(()) }
        fn start_pump(&mut self) -> Result<()> { self.calls.push("start".into()); Ok(()) }
        fn stop_pump(&mut self) -> Result<()> { self.calls.push("stop".into()); Ok(()) }
        fn pause_pump(&mut self) -> Result<()> { self.calls.push("pause".into()); Ok(()) }
        fn get_parameters(&mut self) -> Result<Vec<String>> { Ok(vec![]) }
        fn multipump(&self) -> bool { self.multipump }
        fn current_pump(&self) -> u8 { self.pump }
    }

    #[test]
    fn repeated_value_skips_hardware() {
        let mut conn = CachedConnection::new(CountingPump::default());
        conn.set_rate(5.0).unwrap();
        conn.set_rate(5.0).unwrap();
        conn.set_rate(6.0).unwrap();
        conn.set_rate(5.0).unwrap();
        assert_eq!(conn.inner().calls, vec!["rate 5", "rate 6", "rate 5"]);
    }

    #[test]
    fn controls_are_never_cached() {
        let mut conn = CachedConnection::new(CountingPump::default());
        conn.start_pump().unwrap();
        conn.start_pump().unwrap();
        conn.stop_pump().unwrap();
        conn.stop_pump().unwrap();
        assert_eq!(conn.inner().calls.len(), 4);
    }

    #[test]
    fn reset_forces_next_call_through() {
        let mut conn = CachedConnection::new(CountingPump::default());
        conn.set_units(Units::MlPerMin).unwrap();
        conn.set_diameter(28.6).unwrap();
        conn.reset_cache();
        assert!(conn.cache().is_empty());
        conn.set_units(Units::MlPerMin).unwrap();
        conn.set_diameter(28.6).unwrap();
        assert_eq!(conn.inner().calls.len(), 4);
    }

    #[test]
    fn methods_have_independent_entries() {
        let mut conn = CachedConnection::new(CountingPump::default());
        conn.set_volume(2.0).unwrap();
        conn.set_rate(2.0).unwrap();
        conn.set_delay(2.0).unwrap();
        conn.set_time(2.0).unwrap();
        assert_eq!(conn.inner().calls.len(), 4);
    }

    #[test]
    fn multipump_keys_are_per_pump() {
        let pump = CountingPump { multipump: true, pump: 1, ..CountingPump::default() };
        let mut conn = CachedConnection::new(pump);
        conn.set_rate(3.0).unwrap();
        conn.set_pump(2).unwrap();
        conn.set_rate(3.0).unwrap();
        conn.set_pump(1).unwrap();
        conn.set_rate(3.0).unwrap();
        assert_eq!(conn.inner().calls, vec!["rate 3", "pump 2", "rate 3", "pump 1"]);
    }

    #[test]
    fn failed_call_is_not_recorded() {
        let pump = CountingPump { fail_rate: true, ..CountingPump::default() };
        let mut conn = CachedConnection::new(pump);
        assert!(conn.set_rate(1.0).is_err());
        assert!(conn.cache().is_empty());
        conn.inner_mut().fail_rate = false;
        conn.set_rate(1.0).unwrap();
        assert_eq!(conn.inner().calls, vec!["rate 1"]);
    }

    #[test]
    fn values_compare_structurally() {
        let mut cache = ParameterCache::new();
        cache.record("setX".into(), vec![1.0, 2.0].into());
        assert!(!cache.should_call("setX", &vec![1.0, 2.0].into()));
        assert!(cache.should_call("setX", &vec![2.0, 1.0].into()));

        let mut a = BTreeMap::new();
        a.insert("b".to_string(), ParamValue::from(2.0));
        a.insert("a".to_string(), ParamValue::from("x"));
        cache.record("setY".into(), ParamValue::map(a.clone()));
        assert!(!cache.should_call("setY", &ParamValue::map(a)));
        assert!(cache.should_call("setZ", &ParamValue::from(1.0)));
    }

    #[test]
    fn key_includes_pump_only_in_multipump_mode() {
        assert_eq!(ParameterCache::key("setRate", false, 3), "setRate");
        assert_eq!(ParameterCache::key("setRate", true, 3), "setRate_pump_3");
        assert!(CACHEABLE_METHODS.contains(&"setPump"));
    }
}
