// Zone maintenance against made-up upstream servers.

use core::str::FromStr;
use core::time::Duration;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use zonekeeper::base::rdata::{Dnskey, Rrsig, Soa};
use zonekeeper::base::{
    Class, Message, Name, Opcode, Rcode, Rdata, Record, Rrset, RrsetKey,
    Rtype, Serial, Ttl, UnixTime,
};
use zonekeeper::config::{ManagerConfig, RemoteAddr, ZoneConfig, ZoneType};
use zonekeeper::manager::{Services, ZoneManager};
use zonekeeper::net::mock::MockTransport;
use zonekeeper::net::BoxFuture;
use zonekeeper::sign::{signed_data, Ed25519Key, KeyPair};
use zonekeeper::store::{Journal, MemoryJournal, ZoneVersion};
use zonekeeper::trust::{Anchors, KeyFetch, KeyFetcher, MemoryAnchors, TrustError};
use zonekeeper::xfr::XfrError;
use zonekeeper::zone::{Zone, ZoneError, ZoneFlags};

//------------ Helpers -------------------------------------------------------

fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

fn master(n: u8) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, n], 53))
}

/// Builds a version of `example.` with `hosts` addresses for the name
/// server.
fn version(serial: u32, hosts: u8) -> ZoneVersion {
    let record = |owner: &str, data| {
        Record::new(name(owner), Class::IN, Ttl::from_secs(3600), data)
    };
    let mut records = vec![
        record(
            "example.",
            Rdata::Soa(Soa {
                mname: name("ns1.example."),
                rname: name("hostmaster.example."),
                serial: Serial(serial),
                refresh: Ttl::from_secs(3600),
                retry: Ttl::from_secs(600),
                expire: Ttl::from_secs(86400),
                minimum: Ttl::from_secs(300),
            }),
        ),
        record("example.", Rdata::Ns(name("ns1.example."))),
    ];
    for i in 0..hosts {
        records.push(record(
            "ns1.example.",
            Rdata::A(Ipv4Addr::new(198, 51, 100, i + 1)),
        ));
    }
    ZoneVersion::from_records(name("example."), Class::IN, records).unwrap()
}

fn manager(mock: &MockTransport) -> ZoneManager {
    zonekeeper::logging::init_logging();
    ZoneManager::new(
        ManagerConfig::default(),
        Services::new(Arc::new(mock.clone())),
    )
}

fn slave_config(masters: &[SocketAddr]) -> ZoneConfig {
    ZoneConfig::new(ZoneType::Slave).with_masters(
        masters.iter().copied().map(RemoteAddr::new).collect(),
    )
}

/// Lets the spawned tasks run until `cond` holds.
async fn settle(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn refreshing(zone: &Zone) -> bool {
    zone.flags()
        .intersects(ZoneFlags::REFRESH | ZoneFlags::NEEDREFRESH)
}

fn soa_queries(mock: &MockTransport, addr: SocketAddr) -> usize {
    mock.queries()
        .iter()
        .filter(|req| {
            req.server == addr
                && req.message.header.opcode == Opcode::QUERY
                && req
                    .message
                    .question
                    .as_ref()
                    .map_or(false, |q| q.qtype == Rtype::SOA)
        })
        .count()
}

fn assert_between(when: Option<Instant>, low: Instant, high: Instant) {
    let when = when.expect("timer not set");
    assert!(when >= low, "{when:?} before {low:?}");
    assert!(when <= high, "{when:?} after {high:?}");
}

//------------ Refresh -------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn up_to_date_slave_keeps_its_content() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;

    let journal = Arc::new(MemoryJournal::new());
    zone.set_journal(Some(journal.clone()));
    let before = zone.version().unwrap();
    let start = Instant::now();
    zone.refresh();
    settle(|| !refreshing(&zone)).await;

    assert!(Arc::ptr_eq(&before, &zone.version().unwrap()));
    assert_eq!(zone.serial(), Some(Serial(10)));
    assert!(journal.is_empty());
    assert!(zone.flags().contains(ZoneFlags::HAVETIMERS));
    assert_between(
        zone.timers().refresh,
        start + Duration::from_secs(2700),
        start + Duration::from_secs(3601),
    );
    assert_between(
        zone.timers().expire,
        start + Duration::from_secs(86400),
        start + Duration::from_secs(86401),
    );
}

#[tokio::test(start_paused = true)]
async fn newer_serial_is_transferred_incrementally() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;
    assert_eq!(mock.transfers().last().unwrap().rtype, Rtype::AXFR);

    let journal = Arc::new(MemoryJournal::new());
    zone.set_journal(Some(journal.clone()));
    mock.serve(master(1), version(11, 2));
    zone.refresh();
    settle(|| !refreshing(&zone)).await;

    assert_eq!(mock.transfers().last().unwrap().rtype, Rtype::IXFR);
    assert_eq!(zone.serial(), Some(Serial(11)));
    assert_eq!(journal.last_serial(), Some(Serial(11)));
    let version = zone.version().unwrap();
    assert_eq!(version.find(&name("ns1.example."), Rtype::A).unwrap().len(), 2);
    assert_eq!(manager.counts().xfr_running, 0);
}

#[tokio::test(start_paused = true)]
async fn ixfr_falls_back_to_axfr() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;

    mock.disable_ixfr(master(1));
    mock.serve(master(1), version(12, 3));
    zone.refresh();
    settle(|| !refreshing(&zone)).await;

    let rtypes: Vec<_> = mock.transfers().iter().map(|req| req.rtype).collect();
    assert_eq!(rtypes, [Rtype::AXFR, Rtype::IXFR, Rtype::AXFR]);
    assert_eq!(zone.serial(), Some(Serial(12)));
}

#[tokio::test(start_paused = true)]
async fn unreachable_masters() {
    let mock = MockTransport::new();
    let masters = [master(1), master(2), master(3)];
    for addr in masters {
        mock.serve(addr, version(10, 1));
    }
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&masters))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;
    assert!(!zone.flags().contains(ZoneFlags::NOMASTERS));

    for addr in masters {
        mock.set_down(addr, true);
    }
    let start = Instant::now();
    zone.refresh();
    settle(|| !refreshing(&zone)).await;

    for addr in masters {
        assert!(soa_queries(&mock, addr) > 0, "{addr} never asked");
    }
    assert!(zone.flags().contains(ZoneFlags::NOMASTERS));
    assert_eq!(zone.serial(), Some(Serial(10)));
    // The SOA retry interval without backing off.
    assert_between(
        zone.timers().refresh,
        start + Duration::from_secs(450),
        start + Duration::from_secs(601),
    );

    // A master coming back clears the flag.
    mock.set_down(master(2), false);
    zone.refresh();
    settle(|| !refreshing(&zone)).await;
    assert!(!zone.flags().contains(ZoneFlags::NOMASTERS));
}

#[tokio::test(start_paused = true)]
async fn refresh_while_refreshing_is_ignored() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;

    let base = soa_queries(&mock, master(1));
    zone.refresh();
    zone.refresh();
    zone.refresh();
    settle(|| !refreshing(&zone)).await;
    sleep(Duration::from_secs(1)).await;

    // Requests made while the first one runs change nothing.
    assert_eq!(soa_queries(&mock, master(1)), base + 1);
}

#[tokio::test(start_paused = true)]
async fn notify_during_refresh_queues_one_follow_up() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;

    let base = soa_queries(&mock, master(1));
    let notify = Message::notify(
        name("example."),
        Class::IN,
        version(11, 1).soa_record(),
    );
    zone.refresh();
    assert!(zone.flags().contains(ZoneFlags::REFRESH));
    assert_eq!(zone.notify_received(master(1), &notify), Rcode::NOERROR);
    assert_eq!(zone.notify_received(master(1), &notify), Rcode::NOERROR);
    assert!(zone.flags().contains(ZoneFlags::NEEDREFRESH));
    settle(|| !refreshing(&zone)).await;
    sleep(Duration::from_secs(1)).await;
    settle(|| !refreshing(&zone)).await;

    // The running cycle plus one follow-up for both notifies.
    assert_eq!(soa_queries(&mock, master(1)), base + 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_maintenance() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;

    manager.shutdown();
    assert!(zone.flags().contains(ZoneFlags::EXITING));
    assert!(manager.find_zone(&name("example."), Class::IN).is_none());
    let base = soa_queries(&mock, master(1));
    zone.refresh();
    sleep(Duration::from_secs(7200)).await;
    assert_eq!(soa_queries(&mock, master(1)), base);
}

#[tokio::test(start_paused = true)]
async fn stub_zone_keeps_the_delegation() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 2));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(
            name("example."),
            Class::IN,
            ZoneConfig::new(ZoneType::Stub)
                .with_masters(vec![RemoteAddr::new(master(1))]),
        )
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;

    let version = zone.version().unwrap();
    assert!(version.find(&name("example."), Rtype::NS).is_some());
    assert_eq!(version.find(&name("ns1.example."), Rtype::A).unwrap().len(), 2);
    assert!(mock.transfers().is_empty());
}

//------------ Notify and Forwarding -----------------------------------------

#[tokio::test(start_paused = true)]
async fn notify_from_master_triggers_refresh() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    let manager = manager(&mock);
    let zone = manager
        .create_zone(name("example."), Class::IN, slave_config(&[master(1)]))
        .unwrap();
    zone.load().await.unwrap();
    settle(|| zone.serial() == Some(Serial(10)) && !refreshing(&zone)).await;
    let transfers = mock.transfers().len();

    let notify = |serial: u32| {
        Message::notify(
            name("example."),
            Class::IN,
            version(serial, 1).soa_record(),
        )
    };
    let stranger = SocketAddr::from(([203, 0, 113, 1], 53));
    assert_eq!(zone.notify_received(stranger, &notify(11)), Rcode::REFUSED);

    // Nothing newer than what we have.
    assert_eq!(zone.notify_received(master(1), &notify(10)), Rcode::NOERROR);
    assert!(!refreshing(&zone));
    assert_eq!(mock.transfers().len(), transfers);

    mock.serve(master(1), version(11, 2));
    assert_eq!(zone.notify_received(master(1), &notify(11)), Rcode::NOERROR);
    settle(|| zone.serial() == Some(Serial(11)) && !refreshing(&zone)).await;
    assert_eq!(mock.transfers().len(), transfers + 1);
}

#[tokio::test(start_paused = true)]
async fn transferred_zone_notifies_secondaries() {
    let mock = MockTransport::new();
    let secondary = SocketAddr::from(([192, 0, 2, 99], 53));
    mock.serve(master(1), version(10, 1));
    mock.set_down(secondary, false);
    let manager = manager(&mock);
    let mut config = slave_config(&[master(1)]);
    config.also_notify = vec![RemoteAddr::new(secondary)];
    let zone = manager
        .create_zone(name("example."), Class::IN, config)
        .unwrap();
    zone.load().await.unwrap();
    settle(|| mock.queries_to(secondary, Opcode::NOTIFY) == 1).await;
    settle(|| zone.pending_notifies() == 0).await;

    // The primary master named in the SOA record is left alone.
    assert_eq!(mock.queries_to(master(1), Opcode::NOTIFY), 0);
    assert!(!zone.flags().contains(ZoneFlags::NEEDNOTIFY));
}

#[tokio::test(start_paused = true)]
async fn updates_are_forwarded_to_masters() {
    let mock = MockTransport::new();
    mock.serve(master(1), version(10, 1));
    mock.serve(master(2), version(10, 1));
    let manager = manager(&mock);
    let mut config = slave_config(&[master(1), master(2)]);
    let zone = manager
        .create_zone(name("example."), Class::IN, config.clone())
        .unwrap();
    let mut update = Message::query(name("example."), Rtype::SOA, Class::IN);
    update.header.opcode = Opcode::UPDATE;

    assert!(matches!(
        zone.forward_update(update.clone()).await,
        Err(ZoneError::Xfr(XfrError::Rcode(Rcode::REFUSED)))
    ));

    config.forward_updates = true;
    zone.set_config(config).unwrap();
    mock.set_down(master(1), true);
    let answer = zone.forward_update(update.clone()).await.unwrap();
    assert_eq!(answer.rcode(), Rcode::NOERROR);
    assert_eq!(mock.queries_to(master(2), Opcode::UPDATE), 1);

    mock.set_down(master(2), true);
    assert!(matches!(
        zone.forward_update(update).await,
        Err(ZoneError::Xfr(XfrError::Exhausted))
    ));
}

//------------ Trust Anchors -------------------------------------------------

const DAY: u64 = 86400;

struct TestKey {
    pair: Ed25519Key,
    dnskey: Dnskey,
}

impl TestKey {
    fn new(seed: u8) -> Self {
        let pair = Ed25519Key::from_seed(&[seed; 32]).unwrap();
        let dnskey = pair.dnskey(Dnskey::FLAG_ZONE | Dnskey::FLAG_SEP);
        TestKey { pair, dnskey }
    }
}

/// Hands out whatever key set it was last given.
#[derive(Debug, Default)]
struct ScriptedFetcher {
    next: Mutex<Option<KeyFetch>>,
}

impl ScriptedFetcher {
    /// Publishes `keys` with signatures by `signers`, each signing as the
    /// given DNSKEY record.
    fn publish(&self, keys: &[Dnskey], signers: &[(&TestKey, &Dnskey)]) {
        let now = UnixTime::now();
        let mut dnskeys = Rrset::new(
            name("example."),
            Class::IN,
            RrsetKey::plain(Rtype::DNSKEY),
            Ttl::from_secs(2 * DAY as u32),
        );
        for key in keys {
            dnskeys.insert(Rdata::Dnskey(key.clone()));
        }
        let sigs = signers
            .iter()
            .map(|(key, as_published)| {
                let mut sig = Rrsig {
                    type_covered: Rtype::DNSKEY,
                    algorithm: as_published.algorithm,
                    labels: 1,
                    original_ttl: dnskeys.ttl,
                    expiration: now.add(Duration::from_secs(10 * DAY)).to_serial(),
                    inception: now.sub(Duration::from_secs(3600)).to_serial(),
                    key_tag: as_published.key_tag(),
                    signer_name: name("example."),
                    signature: Default::default(),
                };
                sig.signature = key.pair.sign(&signed_data(&sig, &dnskeys)).unwrap();
                sig
            })
            .collect();
        *self.next.lock() = Some(KeyFetch { dnskeys, sigs });
    }
}

impl KeyFetcher for ScriptedFetcher {
    fn fetch(&self, _name: &Name, _class: Class) -> BoxFuture<Result<KeyFetch, TrustError>> {
        let res = self.next.lock().clone().ok_or(TrustError::NoKeys);
        Box::pin(async move { res })
    }
}

#[tokio::test(start_paused = true)]
async fn trust_anchor_rollover_fails_closed() {
    let (k1, k2) = (TestKey::new(1), TestKey::new(2));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let anchors = Arc::new(MemoryAnchors::new());
    fetcher.publish(
        &[k1.dnskey.clone(), k2.dnskey.clone()],
        &[(&k1, &k1.dnskey)],
    );
    let manager = ZoneManager::new(
        ManagerConfig::default(),
        Services::new(Arc::new(MockTransport::new()))
            .with_key_fetcher(fetcher.clone())
            .with_anchors(anchors.clone()),
    );
    let zone = manager
        .create_zone(name("example."), Class::IN, ZoneConfig::new(ZoneType::Key))
        .unwrap();
    zone.load().await.unwrap();
    zone.add_initial_key(name("example."), k1.dnskey.clone())
        .await
        .unwrap();

    // The new key shows up and starts its hold-down.
    settle(|| zone.managed_keys(&name("example.")).len() == 2).await;
    assert_eq!(
        anchors.get(&name("example.")),
        Some(Anchors::Keys(vec![k1.dnskey.clone()]))
    );
    let pending = zone
        .managed_keys(&name("example."))
        .into_iter()
        .find(|data| data.key.same_key(&k2.dnskey))
        .unwrap();
    assert!(!pending.add_hold_down.is_epoch());

    // The only trusted key is revoked before its successor is accepted.
    fetcher.publish(
        &[k1.dnskey.revoked(), k2.dnskey.clone()],
        &[(&k1, &k1.dnskey.revoked())],
    );
    zone.refresh_keys().unwrap();
    settle(|| anchors.is_fail_closed(&name("example."))).await;
    assert!(zone
        .managed_keys(&name("example."))
        .iter()
        .any(|data| data.key.is_revoked()));
}
