// This file is part of gpadcd, the Basin Cove GPADC sampler daemon
// Copyright (C) 2024 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::net::TcpListener;

use anyhow::{Context, Result};
use async_std::sync::Arc;
use async_std::task::spawn_blocking;
use serde::Serialize;
use tide::{Body, Request, Response, Server};

#[cfg(feature = "systemd")]
use systemd::daemon::{listen_fds, tcp_listener};

use crate::gpadc::{Catalog, Gpadc, Params, SampleError};
use crate::power::PowerGate;
use crate::scu::GpadcSlot;
use crate::watched_tasks::WatchedTasksBuilder;

#[derive(Serialize)]
struct Info {
    version: &'static str,
    attached: bool,
    irq: Option<u32>,
    realbits: u8,
}

/// Everything the HTTP handlers need to know about the GPADC
pub struct Api {
    slot: Arc<GpadcSlot>,
    gate: Arc<PowerGate>,
    // Describes the GPADC while none is attached
    catalog: Catalog,
    realbits: u8,
}

impl Api {
    pub fn new(slot: Arc<GpadcSlot>, gate: Arc<PowerGate>, params: &Params) -> Self {
        Self {
            slot,
            gate,
            catalog: Catalog::new(params),
            realbits: params.realbits,
        }
    }

    fn catalog<'a>(&'a self, gpadc: &'a Option<Arc<Gpadc>>) -> &'a Catalog {
        gpadc.as_deref().map_or(&self.catalog, Gpadc::catalog)
    }
}

fn json<T: Serialize>(value: &T) -> tide::Result {
    Ok(Response::builder(200)
        .body(Body::from_json(value)?)
        .build())
}

/// Let go of a GPADC reference without blocking the executor.
///
/// After the SCU went away the handler may hold the last reference, and
/// dropping that one detaches the device.
async fn release(gpadc: Option<Arc<Gpadc>>) {
    if let Some(gpadc) = gpadc {
        spawn_blocking(move || drop(gpadc)).await;
    }
}

fn sample_error(err: SampleError) -> tide::Error {
    let status = match err {
        SampleError::NoSuchChannel(_) => 404,
        SampleError::BusyTimeout | SampleError::CompletionTimeout => 504,
        SampleError::ChannelIo { .. } => 502,
    };

    tide::Error::from_str(status, err.to_string())
}

/// Read channel `index` from `gpadc`, or explain why that is not possible
async fn sample(gpadc: Option<Arc<Gpadc>>, index: Option<usize>) -> tide::Result {
    let index = match index {
        Some(index) => index,
        None => {
            release(gpadc).await;
            return Err(tide::Error::from_str(404, "No such channel"));
        }
    };

    let gpadc = gpadc.ok_or_else(|| tide::Error::from_str(503, "The GPADC is not attached"))?;

    let sample = spawn_blocking(move || gpadc.read(index))
        .await
        .map_err(sample_error)?;

    json(&sample)
}

async fn info_handler(api: Arc<Api>, _req: Request<()>) -> tide::Result {
    let gpadc = api.slot.get();

    let info = Info {
        version: env!("VERSION_STRING"),
        attached: gpadc.is_some(),
        irq: gpadc.as_ref().map(|g| g.irq()),
        realbits: gpadc.as_ref().map_or(api.realbits, |g| g.realbits()),
    };

    release(gpadc).await;

    json(&info)
}

async fn channels_handler(api: Arc<Api>, _req: Request<()>) -> tide::Result {
    let gpadc = api.slot.get();
    let res = json(&api.catalog(&gpadc).entries());

    release(gpadc).await;

    res
}

async fn channel_handler(api: Arc<Api>, req: Request<()>) -> tide::Result {
    let gpadc = api.slot.get();

    let index = api
        .catalog(&gpadc)
        .channel(req.param("name")?)
        .map(|entry| entry.index);

    sample(gpadc, index).await
}

async fn consumer_handler(api: Arc<Api>, req: Request<()>) -> tide::Result {
    let gpadc = api.slot.get();

    let index = api
        .catalog(&gpadc)
        .consumer(req.param("device")?, req.param("channel")?)
        .map(|entry| entry.index);

    sample(gpadc, index).await
}

async fn get_suspended_handler(api: Arc<Api>, _req: Request<()>) -> tide::Result {
    let gpadc = api.slot.get();

    let suspended = match &gpadc {
        Some(gpadc) => api.gate.suspends(gpadc).await,
        None => false,
    };

    release(gpadc).await;

    json(&suspended)
}

async fn put_suspended_handler(api: Arc<Api>, mut req: Request<()>) -> tide::Result {
    let suspend: bool = req
        .body_json()
        .await
        .map_err(|_| tide::Error::from_str(400, "Malformed payload"))?;

    if !suspend {
        api.gate.resume().await;
        return Ok(Response::new(204));
    }

    let gpadc = api
        .slot
        .get()
        .ok_or_else(|| tide::Error::from_str(503, "The GPADC is not attached"))?;

    api.gate
        .suspend(gpadc)
        .await
        .map_err(|e| tide::Error::from_str(500, format!("{e:#}")))?;

    Ok(Response::new(204))
}

pub fn register(server: &mut Server<()>, api: Api) {
    let api = Arc::new(api);

    let a = api.clone();
    server
        .at("/v1/gpadc/info")
        .get(move |req| info_handler(a.clone(), req));

    let a = api.clone();
    server
        .at("/v1/gpadc/channels")
        .get(move |req| channels_handler(a.clone(), req));

    let a = api.clone();
    server
        .at("/v1/gpadc/channels/:name")
        .get(move |req| channel_handler(a.clone(), req));

    let a = api.clone();
    server
        .at("/v1/gpadc/consumers/:device/:channel")
        .get(move |req| consumer_handler(a.clone(), req));

    let mut route = server.at("/v1/gpadc/suspended");

    let a = api.clone();
    route.get(move |req| get_suspended_handler(a.clone(), req));

    let a = api;
    route.put(move |req| put_suspended_handler(a.clone(), req));
}

#[cfg(feature = "systemd")]
fn socket_activation() -> Vec<TcpListener> {
    listen_fds(true)
        .map(|fds| fds.iter().filter_map(|fd| tcp_listener(fd).ok()).collect())
        .unwrap_or_default()
}

#[cfg(not(feature = "systemd"))]
fn socket_activation() -> Vec<TcpListener> {
    Vec::new()
}

pub fn serve(wtb: &mut WatchedTasksBuilder, server: Server<()>, listen: &[String]) -> Result<()> {
    // Use sockets provided by systemd (if any)
    let mut listeners = socket_activation();

    // Open the configured addresses ourselves if systemd did not provide
    // anything.
    if listeners.is_empty() {
        for addr in listen {
            let listener = TcpListener::bind(addr).with_context(|| {
                format!("Could not bind web API to {addr}, is there already another service running?")
            })?;

            listeners.push(listener);
        }
    }

    wtb.spawn_task("web-server", async move {
        server.listen(listeners).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use async_std::sync::Arc;
    use async_std::task::block_on;
    use serde_json::Value;
    use tide::http::{Method, Request, Response, Url};

    use super::{register, release, Api};
    use crate::gpadc::regmap::regs;
    use crate::gpadc::{Gpadc, Params, Timing};
    use crate::pmic::SimPmic;
    use crate::power::PowerGate;
    use crate::scu::GpadcSlot;

    fn params(realbits: u8, consumer_map: bool) -> Params {
        Params {
            realbits,
            consumer_map,
            timing: Timing {
                busy_poll_interval: Duration::from_micros(10),
                busy_poll_budget: 500,
                completion_timeout: Duration::from_millis(100),
            },
        }
    }

    struct Setup {
        server: tide::Server<()>,
        slot: Arc<GpadcSlot>,
        pmic: SimPmic,
    }

    impl Setup {
        fn new() -> Self {
            Self::with_params(params(11, true))
        }

        fn with_params(configured: Params) -> Self {
            let slot = Arc::new(GpadcSlot::new());
            let gate = Arc::new(PowerGate::new());

            let mut server = tide::new();
            register(&mut server, Api::new(slot.clone(), gate, &configured));

            Self {
                server,
                slot,
                pmic: SimPmic::new(),
            }
        }

        fn attach(&self) {
            self.attach_to(&self.pmic);
        }

        fn attach_to(&self, pmic: &SimPmic) {
            let gpadc = Gpadc::attach(pmic.resources(9), &params(11, true)).unwrap();
            self.slot.replace(Some(Arc::new(gpadc)));
        }

        fn request(&self, method: Method, path: &str, body: Option<&str>) -> Response {
            let url = Url::parse("http://localhost").unwrap().join(path).unwrap();
            let mut req = Request::new(method, url);

            if let Some(body) = body {
                req.set_body(body);
            }

            block_on(self.server.respond(req)).unwrap()
        }

        fn get(&self, path: &str) -> (u16, Value) {
            let mut res = self.request(Method::Get, path, None);
            let status = res.status() as u16;
            let body = block_on(res.body_string()).unwrap();

            (status, serde_json::from_str(&body).unwrap_or(Value::Null))
        }

        fn put(&self, path: &str, body: &str) -> u16 {
            self.request(Method::Put, path, Some(body)).status() as u16
        }
    }

    #[test]
    fn info_and_catalog() {
        let setup = Setup::new();

        let (status, info) = setup.get("/v1/gpadc/info");
        assert_eq!(status, 200);
        assert_eq!(info["attached"], Value::Bool(false));
        assert_eq!(info["irq"], Value::Null);
        assert_eq!(info["realbits"], Value::from(11));

        let (status, channels) = setup.get("/v1/gpadc/channels");
        assert_eq!(status, 200);
        assert_eq!(channels.as_array().unwrap().len(), 9);
        assert_eq!(channels[6]["name"], Value::from("SYSTEMP0"));
        assert_eq!(channels[6]["kind"], Value::from("temperature"));
        assert_eq!(channels[6]["consumers"][1]["device"], Value::from("bcove_thrm"));

        setup.attach();

        let (_, info) = setup.get("/v1/gpadc/info");
        assert_eq!(info["attached"], Value::Bool(true));
        assert_eq!(info["irq"], Value::from(9));
    }

    #[test]
    fn read_channels() {
        let setup = Setup::new();
        setup.attach();
        setup.pmic.set_result(0, 0x021A);
        setup.pmic.set_result(3, 0x0123);

        let (status, sample) = setup.get("/v1/gpadc/channels/vbat");
        assert_eq!(status, 200);
        assert_eq!(sample["channel"], Value::from("VBAT"));
        assert_eq!(sample["raw"], Value::from(0x021A));

        let (status, sample) = setup.get("/v1/gpadc/channels/CH0");
        assert_eq!(status, 200);
        assert_eq!(sample["raw"], Value::from(0x021A));

        let (status, sample) = setup.get("/v1/gpadc/consumers/bcove_thrm/PMICTEMP");
        assert_eq!(status, 200);
        assert_eq!(sample["channel"], Value::from("PMICTEMP"));
        assert_eq!(sample["raw"], Value::from(0x0123));
    }

    #[test]
    fn status_codes() {
        let setup = Setup::new();

        assert_eq!(setup.get("/v1/gpadc/channels/nope").0, 404);
        assert_eq!(setup.get("/v1/gpadc/consumers/bcove_thrm/VBAT").0, 404);
        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 503);
        assert_eq!(setup.put("/v1/gpadc/suspended", "true"), 503);

        setup.attach();

        setup.pmic.set_stuck_busy(true);
        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 504);
        setup.pmic.set_stuck_busy(false);

        setup.pmic.set_drop_interrupts(true);
        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 504);
        setup.pmic.set_drop_interrupts(false);

        setup.pmic.fail_register(Some(regs::GPADCREQ));
        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 502);
        setup.pmic.fail_register(None);

        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 200);

        assert_eq!(setup.put("/v1/gpadc/suspended", "maybe"), 400);
    }

    #[test]
    fn suspend_and_resume() {
        let setup = Setup::new();
        setup.attach();

        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(false));

        assert_eq!(setup.put("/v1/gpadc/suspended", "true"), 204);
        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(true));

        assert_eq!(setup.put("/v1/gpadc/suspended", "false"), 204);
        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(false));

        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 200);
    }

    #[test]
    fn catalog_of_attached_device() {
        let setup = Setup::with_params(params(10, false));

        let (_, info) = setup.get("/v1/gpadc/info");
        assert_eq!(info["realbits"], Value::from(10));

        let (_, channels) = setup.get("/v1/gpadc/channels");
        assert_eq!(channels[6]["consumers"], Value::Array(Vec::new()));
        assert_eq!(setup.get("/v1/gpadc/consumers/SYSTEMP/SYSTEMP0").0, 404);

        setup.attach();

        let (_, info) = setup.get("/v1/gpadc/info");
        assert_eq!(info["realbits"], Value::from(11));

        let (_, channels) = setup.get("/v1/gpadc/channels");
        assert_eq!(channels[6]["realbits"], Value::from(11));
        assert_eq!(channels[6]["consumers"].as_array().unwrap().len(), 2);
        assert_eq!(setup.get("/v1/gpadc/consumers/SYSTEMP/SYSTEMP0").0, 200);
    }

    #[test]
    fn suspended_refers_to_attached_device() {
        let setup = Setup::new();
        setup.attach();

        assert_eq!(setup.put("/v1/gpadc/suspended", "true"), 204);
        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(true));

        // A new device shows up, e.g. after the SCU went away and came back
        let other = SimPmic::new();
        setup.attach_to(&other);

        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(false));
        assert_eq!(setup.get("/v1/gpadc/channels/VBAT").0, 200);

        assert_eq!(setup.put("/v1/gpadc/suspended", "true"), 204);
        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(true));

        // Moving the suspension let go of the old device
        assert!(!setup.pmic.irq_requested());

        assert_eq!(setup.put("/v1/gpadc/suspended", "false"), 204);
        assert_eq!(setup.get("/v1/gpadc/suspended").1, Value::Bool(false));
    }

    #[test]
    fn last_reference_dropped_off_executor() {
        let pmic = SimPmic::new();
        let gpadc = Gpadc::attach(pmic.resources(9), &params(11, true)).unwrap();

        block_on(release(Some(Arc::new(gpadc))));

        let freed_by = pmic.irq_freed_by().unwrap();
        assert_ne!(freed_by, thread::current().id());
    }
}
