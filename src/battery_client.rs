use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use crate::battery_state::{BatteryState, PartialState};
use crate::crc;
use crate::error::{Error, Result};
use crate::message::{decode, lookup, Quantity};
use crate::report::{report, MetricsSink};
use crate::transport::{Characteristic, Transport, RESET_PAYLOAD};

/// How a session retries and how long it waits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Attempts before giving up, counting the first
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next
    pub backoff: Duration,
    /// How long to wait for the reply to one request
    pub reply_timeout: Duration,
    /// Fail an attempt when a reply's CRC does not match its contents
    pub verify_reply_crc: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            // The battery only accepts one connection at a time, so while it's held by a phone
            // connecting fails. A handful of tries a couple of seconds apart usually gets through.
            max_attempts: 5,
            backoff: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(10),
            verify_reply_crc: false,
        }
    }
}

/// The end of one attempt.
#[derive(Debug)]
enum Attempt {
    Success(BatteryState),
    Failure(Error),
}

/// Tracks which request is awaiting its reply. At most one is outstanding.
#[derive(Debug, Default)]
struct Correlator {
    pending: Option<Quantity>,
}

impl Correlator {
    fn expect(&mut self, quantity: Quantity) {
        debug_assert!(self.pending.is_none(), "request sent while another is pending");
        self.pending = Some(quantity);
    }

    /// Match a notification to the pending request, clearing it.
    fn resolve(&mut self, notification: &[u8]) -> Result<Quantity> {
        self.pending.take().ok_or_else(|| {
            Error::Protocol(format!(
                "notification with no request pending: {}",
                hex::encode(notification)
            ))
        })
    }
}

/// Reads a battery over a [`Transport`], one request at a time.
pub struct BatteryClient<T> {
    transport: T,
    config: SessionConfig,
}

impl<T: Transport> BatteryClient<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self { transport, config }
    }

    #[cfg(test)]
    fn transport(&self) -> &T {
        &self.transport
    }

    /// Read the battery at `address` and, if that succeeds, report the reading to `sink`.
    ///
    /// Nothing is reported when every attempt fails.
    pub async fn read_battery<S: MetricsSink>(
        &mut self,
        address: &str,
        sink: &mut S,
    ) -> Result<BatteryState> {
        let state = self.fetch_state(address).await?;
        report(sink, address, &state).await;
        Ok(state)
    }

    /// Read the current state from the battery, retrying the whole exchange on any failure.
    pub async fn fetch_state(&mut self, address: &str) -> Result<BatteryState> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut tries = 0;

        loop {
            tries += 1;
            match self.attempt(address).await {
                Attempt::Success(state) => {
                    tracing::info!(address, tries, ?state, "battery read");
                    return Ok(state);
                }
                Attempt::Failure(err) if tries < max_attempts => {
                    tracing::warn!(address, tries, %err, "battery read failed, trying again");
                    sleep(self.config.backoff).await;
                }
                Attempt::Failure(err) => {
                    tracing::error!(address, tries, %err, "battery read failed, giving up");
                    return Err(Error::RetriesExhausted {
                        attempts: tries,
                        last: Box::new(err),
                    });
                }
            }
        }
    }

    /// One full exchange. The transport is always disconnected afterwards, whatever happened.
    async fn attempt(&mut self, address: &str) -> Attempt {
        let result = self.exchange(address).await;
        self.transport.disconnect().await;

        match result {
            Ok(state) => Attempt::Success(state),
            Err(err) => Attempt::Failure(err),
        }
    }

    async fn exchange(&mut self, address: &str) -> Result<BatteryState> {
        self.transport.connect(address).await?;
        tracing::info!(address, "Reading from battery");

        tracing::debug!("Resetting BT module");
        self.transport
            .write(Characteristic::ResetControl, &RESET_PAYLOAD)
            .await?;

        let (handler, mut notifications) = mpsc::channel(1);
        self.transport.subscribe(Characteristic::Notify, handler).await?;

        let mut correlator = Correlator::default();
        let mut readings = PartialState::default();
        for quantity in Quantity::ALL {
            let value = self.query(quantity, &mut correlator, &mut notifications).await?;
            readings.insert(quantity, value);
        }

        self.transport.unsubscribe(Characteristic::Notify).await;

        readings.complete()
    }

    /// Send the request for `quantity` and wait for its reply.
    async fn query(
        &mut self,
        quantity: Quantity,
        correlator: &mut Correlator,
        notifications: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<f64> {
        // Let a pending notification forwarder deliver first. Anything queued now
        // arrived with nothing pending
        tokio::task::yield_now().await;
        while let Ok(stray) = notifications.try_recv() {
            if let Err(err) = correlator.resolve(&stray) {
                tracing::warn!(%err, "ignoring notification");
            }
        }

        tracing::debug!("Reading battery {quantity}");
        let request = lookup(quantity).request();
        correlator.expect(quantity);
        tracing::debug!(tx = %hex::encode(&request), "request");
        self.transport
            .write(Characteristic::CommandWrite, &request)
            .await?;

        let reply = timeout(self.config.reply_timeout, notifications.recv())
            .await
            .map_err(|_| Error::ReplyTimeout {
                quantity,
                timeout: self.config.reply_timeout,
            })?
            .ok_or_else(|| Error::Connection("notification stream closed".into()))?;
        tracing::debug!(rx = %hex::encode(&reply), "reply");

        let quantity = correlator.resolve(&reply)?;
        // A short reply is a decode error whether or not its CRC matches
        let value = decode(quantity, &reply)?;
        self.check_crc(quantity, &reply)?;
        tracing::info!("{quantity}: {value}");

        Ok(value)
    }

    /// Compare a reply's CRC with its contents. Only fatal when configured to be.
    fn check_crc(&self, quantity: Quantity, reply: &[u8]) -> Result<()> {
        if crc::verify(reply) {
            return Ok(());
        }
        // Already decoded, so long enough to carry a CRC
        let Some((body, carried)) = crc::split_crc(reply) else {
            return Ok(());
        };

        let computed = crc::crc(body);

        let expected = u16::from_le_bytes(computed);
        let actual = u16::from_le_bytes(carried);
        if self.config.verify_reply_crc {
            return Err(Error::ChecksumMismatch { quantity, expected, actual });
        }

        tracing::debug!(%quantity, expected, actual, "reply CRC mismatch, ignored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Measurement;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    /// Decides the reply to a request, given the attempt number (from 1) and the quantity asked for.
    type Responder = Box<dyn Fn(u32, Quantity) -> Option<Vec<u8>> + Send>;

    /// An in-memory battery that answers from a script and counts what it is asked to do.
    struct ScriptedTransport {
        failing_connects: u32,
        respond: Responder,
        stray_notification: Option<Vec<u8>>,
        /// Send every reply twice, the copy arriving once the first has been taken
        duplicate_replies: bool,
        handler: Option<mpsc::Sender<Vec<u8>>>,
        connects: u32,
        disconnects: u32,
        unsubscribes: u32,
        writes: Vec<(Characteristic, Vec<u8>)>,
    }

    impl ScriptedTransport {
        fn new(respond: Responder) -> Self {
            Self {
                failing_connects: 0,
                respond,
                stray_notification: None,
                duplicate_replies: false,
                handler: None,
                connects: 0,
                disconnects: 0,
                unsubscribes: 0,
                writes: Vec::new(),
            }
        }

        fn healthy() -> Self {
            Self::new(Box::new(|_: u32, quantity: Quantity| Some(good_reply(quantity))))
        }

        fn requests(&self) -> Vec<Quantity> {
            self.writes
                .iter()
                .filter(|(c, _)| *c == Characteristic::CommandWrite)
                .map(|(_, bytes)| {
                    Quantity::ALL
                        .into_iter()
                        .find(|q| lookup(*q).request() == *bytes)
                        .unwrap()
                })
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        async fn connect(&mut self, _address: &str) -> Result<()> {
            self.connects += 1;
            if self.connects <= self.failing_connects {
                return Err(Error::Connection("device is connected to another host".into()));
            }
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.disconnects += 1;
            self.handler = None;
        }

        async fn write(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Result<()> {
            self.writes.push((characteristic, bytes.to_vec()));
            if characteristic != Characteristic::CommandWrite {
                return Ok(());
            }

            let quantity = Quantity::ALL
                .into_iter()
                .find(|q| lookup(*q).request() == bytes)
                .ok_or_else(|| Error::Write { characteristic, reason: "unknown request".into() })?;
            if let (Some(reply), Some(handler)) = ((self.respond)(self.connects, quantity), &self.handler) {
                if self.duplicate_replies {
                    let handler = handler.clone();
                    let copy = reply.clone();
                    tokio::spawn(async move {
                        let _ = handler.send(copy).await;
                    });
                }
                handler.try_send(reply).unwrap();
            }
            Ok(())
        }

        async fn subscribe(
            &mut self,
            _characteristic: Characteristic,
            handler: mpsc::Sender<Vec<u8>>,
        ) -> Result<()> {
            if let Some(stray) = &self.stray_notification {
                handler.try_send(stray.clone()).unwrap();
            }
            self.handler = Some(handler);
            Ok(())
        }

        async fn unsubscribe(&mut self, _characteristic: Characteristic) {
            self.unsubscribes += 1;
            self.handler = None;
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<Measurement>);

    impl MetricsSink for Recorder {
        async fn record(&mut self, measurement: &Measurement) {
            self.0.push(measurement.clone());
        }
    }

    fn good_reply(quantity: Quantity) -> Vec<u8> {
        let body = match quantity {
            Quantity::Voltage => "ff03020084",
            Quantity::Current => "ff0302ffce",
            Quantity::Temperature => "ff030200d7",
            Quantity::Charge => "ff030400003a98",
        };
        crc::frame(&hex::decode(body).unwrap())
    }

    fn expected_state() -> BatteryState {
        BatteryState { voltage_v: 13.2, current_a: -0.5, temperature_c: 21.5, charge_ah: 7.5 }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig { reply_timeout: Duration::from_secs(1), ..SessionConfig::default() }
    }

    #[tokio::test]
    async fn test_read_first_try() {
        let mut client = BatteryClient::new(ScriptedTransport::healthy(), fast_config());
        let mut sink = Recorder::default();

        let state = client.read_battery(ADDRESS, &mut sink).await.unwrap();
        assert_eq!(state, expected_state());

        let transport = client.transport();
        assert_eq!(transport.connects, 1);
        assert_eq!(transport.disconnects, 1);
        assert_eq!(transport.unsubscribes, 1);
        assert_eq!(
            transport.writes[0],
            (Characteristic::ResetControl, RESET_PAYLOAD.to_vec())
        );
        assert_eq!(transport.requests(), Quantity::ALL.to_vec());
        assert_eq!(sink.0, vec![Measurement::from_state(ADDRESS, &expected_state())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_five_attempts() {
        let mut transport = ScriptedTransport::healthy();
        transport.failing_connects = u32::MAX;
        let mut client = BatteryClient::new(transport, SessionConfig::default());
        let mut sink = Recorder::default();

        let err = client.read_battery(ADDRESS, &mut sink).await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, Error::Connection(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let transport = client.transport();
        assert_eq!(transport.connects, 5);
        assert_eq!(transport.disconnects, 5);
        assert!(transport.writes.is_empty());
        assert!(sink.0.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let mut transport = ScriptedTransport::healthy();
        transport.failing_connects = 2;
        let mut client = BatteryClient::new(transport, SessionConfig::default());
        let mut sink = Recorder::default();

        let started = tokio::time::Instant::now();
        let state = client.read_battery(ADDRESS, &mut sink).await.unwrap();
        assert_eq!(state, expected_state());
        assert!(started.elapsed() >= Duration::from_secs(4));

        let transport = client.transport();
        assert_eq!(transport.connects, 3);
        assert_eq!(transport.disconnects, 3);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].tags, vec![("battery".to_string(), ADDRESS.to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reply_restarts_whole_sequence() {
        let transport = ScriptedTransport::new(Box::new(|attempt: u32, quantity: Quantity| {
            if attempt == 1 && quantity == Quantity::Temperature {
                Some(hex::decode("ff0302").unwrap())
            } else {
                Some(good_reply(quantity))
            }
        }));
        let mut client = BatteryClient::new(transport, fast_config());

        let state = client.fetch_state(ADDRESS).await.unwrap();
        assert_eq!(state, expected_state());

        let transport = client.transport();
        assert_eq!(transport.connects, 2);
        assert_eq!(transport.disconnects, 2);
        assert_eq!(
            transport.requests(),
            vec![
                Quantity::Voltage,
                Quantity::Current,
                Quantity::Temperature,
                Quantity::Voltage,
                Quantity::Current,
                Quantity::Temperature,
                Quantity::Charge,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_times_out() {
        let transport = ScriptedTransport::new(Box::new(|_: u32, quantity: Quantity| {
            (quantity != Quantity::Charge).then(|| good_reply(quantity))
        }));
        let mut client = BatteryClient::new(transport, fast_config());
        let mut sink = Recorder::default();

        let err = client.read_battery(ADDRESS, &mut sink).await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts: 5, last } => {
                assert!(matches!(*last, Error::ReplyTimeout { quantity: Quantity::Charge, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(client.transport().disconnects, 5);
        assert_eq!(client.transport().unsubscribes, 0);
        assert!(sink.0.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_notification_ignored() {
        let mut transport = ScriptedTransport::healthy();
        // Would decode as 99.9 V if taken as the voltage reply
        transport.stray_notification = Some(crc::frame(&hex::decode("ff030203e7").unwrap()));
        let mut client = BatteryClient::new(transport, fast_config());

        let state = client.fetch_state(ADDRESS).await.unwrap();
        assert_eq!(state, expected_state());
        assert_eq!(client.transport().connects, 1);
    }

    #[tokio::test]
    async fn test_duplicate_replies_ignored() {
        let mut transport = ScriptedTransport::healthy();
        transport.duplicate_replies = true;
        let mut client = BatteryClient::new(transport, fast_config());

        let state = client.fetch_state(ADDRESS).await.unwrap();
        assert_eq!(state, expected_state());
        assert_eq!(client.transport().connects, 1);
        assert_eq!(client.transport().requests(), Quantity::ALL.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reply_is_decode_error_when_verifying() {
        let transport = ScriptedTransport::new(Box::new(|_: u32, _: Quantity| {
            Some(hex::decode("ff0302").unwrap())
        }));
        let config = SessionConfig { verify_reply_crc: true, max_attempts: 1, ..fast_config() };
        let mut client = BatteryClient::new(transport, config);

        let err = client.fetch_state(ADDRESS).await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts: 1, last } => {
                assert!(matches!(*last, Error::Decode { quantity: Quantity::Voltage, needed: 5, actual: 3 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_crc_rejected_when_verifying() {
        let bad_crc = |_: u32, quantity: Quantity| {
            let mut reply = good_reply(quantity);
            let last = reply.len() - 1;
            reply[last] ^= 0xff;
            Some(reply)
        };

        let config = SessionConfig { verify_reply_crc: true, max_attempts: 1, ..fast_config() };
        let mut client = BatteryClient::new(ScriptedTransport::new(Box::new(bad_crc)), config);
        let err = client.fetch_state(ADDRESS).await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts: 1, last } => {
                assert!(matches!(*last, Error::ChecksumMismatch { quantity: Quantity::Voltage, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let mut client = BatteryClient::new(ScriptedTransport::new(Box::new(bad_crc)), fast_config());
        assert_eq!(client.fetch_state(ADDRESS).await.unwrap(), expected_state());
    }

    #[test]
    fn test_correlator() {
        let mut correlator = Correlator::default();
        assert!(matches!(correlator.resolve(&[0xff]), Err(Error::Protocol(_))));

        correlator.expect(Quantity::Charge);
        assert_eq!(correlator.resolve(&[0xff]).unwrap(), Quantity::Charge);
        assert!(matches!(correlator.resolve(&[0xff]), Err(Error::Protocol(_))));
    }
}
