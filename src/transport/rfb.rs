// src/transport/rfb.rs

//! RFB (VNC) viewer transport over `rustvncserver`.
//!
//! The server engine does its socket I/O and encoding on a private tokio
//! runtime; this adapter is the only thing the bridge talks to, and every
//! call that publishes pixel data blocks on that runtime from the bridge
//! thread. The core's single-writer discipline over the surface therefore
//! survives: the engine only ever receives copies.
//!
//! Viewer input (keys, pointer, clipboard) has nowhere to go, since the
//! virtual display has no input path, so those events are drained and dropped.

use crate::config::ServerConfig;
use crate::device::Rect;
use crate::screen::FrameSurface;
use crate::transport::{TransportEvent, ViewerTransport};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rustvncserver::server::ServerEvent;
use rustvncserver::VncServer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub struct RfbTransport {
    config: ServerConfig,
    runtime: Runtime,
    server: Option<Arc<VncServer>>,
    events: Option<UnboundedReceiver<ServerEvent>>,
    listener: Option<JoinHandle<()>>,
}

impl RfbTransport {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to build the RFB server runtime")?;
        Ok(RfbTransport {
            config: config.clone(),
            runtime,
            server: None,
            events: None,
            listener: None,
        })
    }
}

impl ViewerTransport for RfbTransport {
    fn start(&mut self, surface: &FrameSurface) -> Result<()> {
        let (server, events) = VncServer::new(
            surface.width as u16,
            surface.height as u16,
            self.config.desktop_name.clone(),
            None,
        );
        let server = Arc::new(server);

        let port = self.config.port;
        let listen_server = server.clone();
        let listener = self.runtime.spawn(async move {
            if let Err(e) = listen_server.listen(port).await {
                warn!("RFB listener exited: {}", e);
            }
        });

        self.runtime
            .block_on(server.framebuffer().update_from_slice(surface.data()))
            .map_err(|e| anyhow!("failed to publish the initial framebuffer: {}", e))?;

        info!(
            "RFB server '{}' listening on port {} at {}x{}",
            self.config.desktop_name, port, surface.width, surface.height
        );
        self.server = Some(server);
        self.events = Some(events);
        self.listener = Some(listener);
        Ok(())
    }

    fn replace_framebuffer(&mut self, surface: &FrameSurface) -> Result<()> {
        let Some(server) = &self.server else {
            return Ok(());
        };
        self.runtime
            .block_on(async {
                server
                    .framebuffer()
                    .resize(surface.width as u16, surface.height as u16)
                    .await?;
                server.framebuffer().update_from_slice(surface.data()).await
            })
            .map_err(|e| {
                anyhow!(
                    "failed to install the {}x{} framebuffer: {}",
                    surface.width,
                    surface.height,
                    e
                )
            })?;
        debug!(
            "Viewers now see a {}x{} framebuffer",
            surface.width, surface.height
        );
        Ok(())
    }

    fn mark_rect_dirty(&mut self, surface: &FrameSurface, rect: &Rect) {
        let Some(server) = &self.server else {
            return;
        };
        let bytes = surface.rect_bytes(rect);
        if bytes.is_empty() {
            return;
        }
        let width = (rect.x2 - rect.x1) as u16;
        let height = (rect.y2 - rect.y1 + 1) as u16;
        if let Err(e) = self.runtime.block_on(server.framebuffer().update_cropped(
            &bytes,
            rect.x1 as u16,
            rect.y1 as u16,
            width,
            height,
        )) {
            warn!(
                "Failed to mark ({},{})-({},{}) dirty: {}",
                rect.x1, rect.y1, rect.x2, rect.y2, e
            );
        }
    }

    fn process_events(&mut self, budget: Duration) -> Vec<TransportEvent> {
        let mut transitions = Vec::new();
        let Some(events) = &mut self.events else {
            // Nothing to service; still burn the slice so the loop keeps
            // its pacing.
            std::thread::sleep(budget);
            return transitions;
        };

        let deadline = Instant::now() + budget;
        let mut channel_closed = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self
                .runtime
                .block_on(tokio::time::timeout(remaining, events.recv()))
            {
                Ok(Some(ServerEvent::ClientConnected { client_id })) => {
                    debug!("RFB client {} connected", client_id);
                    transitions.push(TransportEvent::ClientConnected);
                }
                Ok(Some(ServerEvent::ClientDisconnected { client_id })) => {
                    debug!("RFB client {} disconnected", client_id);
                    transitions.push(TransportEvent::ClientGone);
                }
                Ok(Some(_)) => {
                    // Key, pointer and clipboard traffic: dropped.
                }
                Ok(None) => {
                    channel_closed = true;
                    break;
                }
                Err(_) => break, // budget exhausted
            }
        }
        if channel_closed {
            warn!("RFB event channel closed");
            self.events = None;
        }
        transitions
    }

    fn is_active(&self) -> bool {
        match &self.listener {
            Some(task) => !task.is_finished(),
            None => false,
        }
    }

    fn shutdown(&mut self, force: bool) {
        if self.server.is_none() && self.listener.is_none() {
            return;
        }
        info!(
            "Shutting down the RFB server{}",
            if force { " (forced)" } else { "" }
        );
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.events = None;
        self.server = None;
    }
}
