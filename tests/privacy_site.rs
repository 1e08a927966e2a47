mod common;

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use locveil::{
    config::{PrivacyConfig, RedirectConfig},
    error::VerifyError,
    message::{MapRequest, RedirectMessage},
    redirect::{ClientController, ClientState},
    reply::{Outbound, PrivacyMapReplyGenerator},
    selector::AddressSelector,
    verifier::{Arrival, ConsistencyVerifier, Verdict},
    CostModel, Duration, Scheduler, SimScheduler, SitePools, Timestamp,
};

use crate::common::{enable_tracing, hosts, pool, table, Event, MemoryNet};

fn pools() -> SitePools {
    SitePools {
        rlocs: pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
        services: pool(&["172.16.0.1", "172.16.0.2", "172.16.0.3", "172.16.0.4"]),
        public_service: Some("172.16.0.100".parse().unwrap()),
    }
}

fn request(nonce: u64, source_eid: IpAddr) -> MapRequest {
    MapRequest {
        nonce,
        source_eid,
        itr_rloc: "198.51.100.1".parse().unwrap(),
        eid: "172.16.0.1".parse().unwrap(),
    }
}

/// Runs the generator's timers to completion, returning what it sent and when.
fn drain_replies(
    generator: &mut PrivacyMapReplyGenerator,
    scheduler: &mut SimScheduler<Event>,
) -> Vec<(Timestamp, Outbound)> {
    let mut sent = vec![];
    scheduler.run(|scheduler, fired| match fired.event {
        Event::Reply(event) => sent.push((scheduler.now(), generator.on_event(event).unwrap())),
        other => panic!("unexpected event {other:?}"),
    });

    sent
}

fn data(source: IpAddr, destination: IpAddr, outer: Option<IpAddr>) -> Arrival<Bytes> {
    Arrival {
        source,
        destination,
        outer_destination: outer,
        payload: Bytes::from_static(b"data"),
    }
}

#[test]
fn rloc_redirect_is_stable_per_subnet_and_verified() {
    enable_tracing();

    let privacy = PrivacyConfig {
        rloc_redirect: true,
        rloc_check: true,
        ..Default::default()
    };
    let mut generator =
        PrivacyMapReplyGenerator::new(&privacy, &RedirectConfig::default(), pools()).unwrap();
    let mut verifier = ConsistencyVerifier::new(&privacy, pools()).unwrap();
    let mut scheduler = SimScheduler::new();

    // 192.0.2.10 collapses to 192.0.2.0 under /24.
    let index = crc32fast::hash(b"192.0.2.0") as usize % 3;
    let selected = pools().rlocs.get(index).unwrap();

    let client: IpAddr = "192.0.2.10".parse().unwrap();
    for nonce in 0..5 {
        generator
            .generate(&request(nonce, client), &table(), &mut scheduler)
            .unwrap();
    }
    generator
        .generate(&request(5, "192.0.2.77".parse().unwrap()), &table(), &mut scheduler)
        .unwrap();

    let sent = drain_replies(&mut generator, &mut scheduler);
    assert_eq!(sent.len(), 6);
    for (_, outbound) in &sent {
        match outbound {
            Outbound::Reply { reply, .. } => assert_eq!(reply.locators, vec![selected]),
            other => panic!("unexpected {other:?}"),
        }
    }
    // Only the first request of the subnet paid for the hash.
    assert_eq!(
        sent.iter().map(|(at, _)| *at).max(),
        Some(Timestamp::ZERO + Duration::microseconds(40))
    );
    assert_eq!(generator.waiting(), 0);

    // A neighbour tunnelling to the selected locator is accepted, to any other locator it isn't.
    let neighbour: IpAddr = "192.0.2.77".parse().unwrap();
    let service: IpAddr = "172.16.0.1".parse().unwrap();
    assert!(matches!(
        verifier.verify(&data(neighbour, service, Some(selected))),
        Ok(Verdict::Accept { checks: 1, .. })
    ));
    for other in pools().rlocs.iter().copied().filter(|addr| *addr != selected) {
        assert!(matches!(
            verifier.verify(&data(neighbour, service, Some(other))),
            Ok(Verdict::Reject(VerifyError::RlocMismatch { .. }))
        ));
    }
}

#[test]
fn fast_redirect_timing_and_follow_up() {
    const REQUESTS: u8 = 10;

    let cost = Duration::microseconds(40);
    let privacy = PrivacyConfig {
        fast_redirect: true,
        eid_check: true,
        hash_cost: CostModel::constant(cost),
        ..Default::default()
    };
    let redirect = RedirectConfig::default();
    let mut generator = PrivacyMapReplyGenerator::new(&privacy, &redirect, pools()).unwrap();
    let mut verifier = ConsistencyVerifier::new(&privacy, pools()).unwrap();
    let mut scheduler = SimScheduler::new();

    // Requesters from distinct subnets so they are redirected to different services.
    let requesters: Vec<IpAddr> = (0..REQUESTS)
        .map(|i| IpAddr::from([192, 0, 2 + i, 10]))
        .collect();
    for (nonce, requester) in requesters.iter().enumerate() {
        generator
            .generate(&request(nonce as u64, *requester), &table(), &mut scheduler)
            .unwrap();
    }
    assert_eq!(generator.waiting(), REQUESTS as usize);

    let sent = drain_replies(&mut generator, &mut scheduler);
    let redirects: Vec<_> = sent
        .into_iter()
        .filter_map(|(at, outbound)| match outbound {
            Outbound::Redirect { to, message, .. } => Some((at, to, message)),
            Outbound::Reply { .. } => None,
        })
        .collect();

    let times: Vec<_> = redirects.iter().map(|(at, ..)| *at).collect();
    let expected: Vec<_> = (1..=REQUESTS as u32)
        .map(|i| Timestamp::ZERO + cost * i)
        .collect();
    assert_eq!(times, expected);
    assert_eq!(generator.waiting(), 0);

    // Each host follows its redirect and its traffic passes the EID check.
    let mut net = MemoryNet::default();
    let selector = AddressSelector::masked(24);
    for (_, to, message) in redirects {
        let mut client =
            ClientController::new(&redirect, to.ip(), "203.0.113.1:50000".parse().unwrap())
                .unwrap();
        client.on_data(SocketAddr::new(to.ip(), 50000), message.to_bytes(), &mut scheduler);

        let fired = scheduler.pop().unwrap();
        let Event::Client(event) = fired.event else {
            panic!("expected the client's contact");
        };
        client.on_event(event, &mut net).unwrap();

        let target = selector.select(to.ip(), &pools().services).unwrap();
        assert_eq!(
            client.state(),
            ClientState::Connected {
                remote: SocketAddr::new(target, 50000)
            }
        );

    }

    for datagram in net.drain() {
        verifier
            .on_arrival(data(datagram.from.ip(), datagram.to.ip(), None), &mut scheduler)
            .unwrap()
            .unwrap();
    }

    let mut delivered = 0;
    scheduler.run(|_, fired| match fired.event {
        Event::Verifier(event) => {
            verifier.on_event(event);
            delivered += 1;
        }
        other => panic!("unexpected event {other:?}"),
    });
    assert_eq!(delivered, REQUESTS);
    assert_eq!(verifier.waiting(), 0);
    for requester in requesters {
        assert_eq!(verifier.violations(requester), 0);
    }
}

#[test]
fn reverse_nat_steers_public_traffic() {
    let privacy = PrivacyConfig {
        reverse_nat: true,
        ..Default::default()
    };
    let mut verifier = ConsistencyVerifier::new(&privacy, pools()).unwrap();
    let mut scheduler = SimScheduler::new();
    let public = pools().public_service.unwrap();
    let selector = AddressSelector::masked(24);

    for source in hosts([198, 51, 100], 20) {
        verifier
            .on_arrival(data(source, public, None), &mut scheduler)
            .unwrap()
            .unwrap();
    }

    let mut delivered = vec![];
    scheduler.run(|_, fired| match fired.event {
        Event::Verifier(event) => delivered.push(verifier.on_event(event)),
        other => panic!("unexpected event {other:?}"),
    });

    let expected = selector
        .select("198.51.100.1".parse().unwrap(), &pools().services)
        .unwrap();
    assert_eq!(delivered.len(), 20);
    assert!(delivered.iter().all(|arrival| arrival.destination == expected));

    // Skipping the public address is refused.
    assert!(matches!(
        verifier.verify(&data("198.51.100.1".parse().unwrap(), expected, None)),
        Ok(Verdict::Reject(VerifyError::BypassedService { .. }))
    ));
}

#[test]
fn proxy_replies_only_without_redirect_modes() {
    let redirect = RedirectConfig::default();

    let plain =
        PrivacyMapReplyGenerator::new(&PrivacyConfig::default(), &redirect, pools()).unwrap();
    assert!(plain.proxy_reply_allowed());

    for privacy in [
        PrivacyConfig {
            rloc_redirect: true,
            ..Default::default()
        },
        PrivacyConfig {
            fast_redirect: true,
            ..Default::default()
        },
    ] {
        let generator = PrivacyMapReplyGenerator::new(&privacy, &redirect, pools()).unwrap();
        assert!(!generator.proxy_reply_allowed());
    }
}

#[test]
fn redirect_message_targets_survive_the_wire() {
    let target: IpAddr = "172.16.0.3".parse().unwrap();
    let bytes = RedirectMessage::redirect_to(target).to_bytes();

    assert_eq!(bytes[0], 1);
    assert_eq!(&bytes[1..], &[172, 16, 0, 3]);
    assert_eq!(RedirectMessage::decode(bytes).unwrap().target(), Some(target));
}

#[test]
fn cancelled_deliveries_release_their_slot() {
    use rand::{seq::SliceRandom, thread_rng};

    let privacy = PrivacyConfig {
        eid_check: true,
        ..Default::default()
    };
    let mut verifier = ConsistencyVerifier::new(&privacy, pools()).unwrap();
    let mut scheduler = SimScheduler::new();
    let selector = AddressSelector::masked(24);

    let mut ids = vec![];
    for source in hosts([203, 0, 113], 100) {
        let destination = selector.select(source, &pools().services).unwrap();
        let id = verifier
            .on_arrival(data(source, destination, None), &mut scheduler)
            .unwrap()
            .unwrap();
        ids.push(id);
    }
    assert_eq!(verifier.waiting(), 100);

    let mut rng = thread_rng();
    ids.shuffle(&mut rng);
    let (cancelled, kept) = ids.split_at(40);
    for id in cancelled {
        assert!(scheduler.cancel(*id));
    }
    assert_eq!(verifier.waiting(), kept.len());

    let delivered = scheduler.run(|_, fired| match fired.event {
        Event::Verifier(event) => {
            verifier.on_event(event);
        }
        other => panic!("unexpected event {other:?}"),
    });
    assert_eq!(delivered, kept.len());
    assert_eq!(verifier.waiting(), 0);
}
