// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The in-browser monitoring agent source
//!
//! Served inline by the injection rewriter. The agent reads its wiring from
//! `window.__BRUMMER__` (process name and proxy host, set by the preamble),
//! batches events, and posts them to the in-band telemetry endpoint.

/// JavaScript source of the telemetry agent.
pub const AGENT_SOURCE: &str = r#"(function () {
  'use strict';
  if (window.__brummerMonitorActive) { return; }
  window.__brummerMonitorActive = true;

  var cfg = window.__BRUMMER__ || {};
  var endpoint = 'http://' + (cfg.proxyHost || window.location.host) + '/__brummer_telemetry__';
  var sessionId = 'bs-' + Date.now().toString(36) + '-' + Math.random().toString(36).slice(2, 10);
  var queue = [];
  var FLUSH_MS = 2000;
  var MAX_BATCH = 50;

  function push(type, data) {
    queue.push({
      type: type,
      timestamp: Date.now(),
      sessionId: sessionId,
      url: window.location.href,
      data: data || {}
    });
    if (queue.length >= MAX_BATCH) { flush(); }
  }

  function flush() {
    if (!queue.length) { return; }
    var events = queue.splice(0, queue.length);
    var body = JSON.stringify({
      sessionId: sessionId,
      events: events,
      metadata: {
        url: window.location.href,
        referrer: document.referrer,
        userAgent: navigator.userAgent,
        timestamp: Date.now(),
        viewport: { width: window.innerWidth, height: window.innerHeight },
        connection: navigator.connection
          ? { effectiveType: navigator.connection.effectiveType, downlink: navigator.connection.downlink }
          : undefined
      }
    });
    try {
      if (navigator.sendBeacon) {
        navigator.sendBeacon(endpoint, new Blob([body], { type: 'application/json' }));
      } else {
        fetch(endpoint, { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: body, keepalive: true });
      }
    } catch (e) { /* telemetry must never break the page */ }
  }

  window.addEventListener('error', function (e) {
    push('javascript_error', {
      message: e.message,
      source: e.filename,
      line: e.lineno,
      column: e.colno,
      stack: e.error && e.error.stack
    });
  });

  window.addEventListener('unhandledrejection', function (e) {
    push('unhandled_rejection', { reason: String(e.reason) });
  });

  ['log', 'info', 'warn', 'error', 'debug'].forEach(function (level) {
    var original = console[level];
    console[level] = function () {
      push('console_output', {
        level: level,
        message: Array.prototype.slice.call(arguments).map(String).join(' ')
      });
      return original.apply(console, arguments);
    };
  });

  ['click', 'input', 'submit'].forEach(function (kind) {
    document.addEventListener(kind, function (e) {
      var t = e.target || {};
      push('user_interaction', {
        kind: kind,
        tag: t.tagName,
        id: t.id || undefined
      });
    }, { capture: true, passive: true });
  });

  document.addEventListener('visibilitychange', function () {
    push('visibility_change', { state: document.visibilityState });
  });

  window.addEventListener('load', function () {
    push('page_load', { title: document.title });
    var nav = performance.getEntriesByType && performance.getEntriesByType('navigation')[0];
    if (nav) {
      push('performance_metrics', {
        domContentLoaded: nav.domContentLoadedEventEnd,
        load: nav.loadEventEnd,
        ttfb: nav.responseStart
      });
    }
  });

  if (window.PerformanceObserver) {
    try {
      new PerformanceObserver(function (list) {
        list.getEntries().forEach(function (entry) {
          push('long_task', { duration: entry.duration, start: entry.startTime });
        });
      }).observe({ entryTypes: ['longtask'] });
    } catch (e) { /* longtask unsupported */ }
  }

  if (performance.memory) {
    setInterval(function () {
      push('memory_usage', {
        usedJSHeapSize: performance.memory.usedJSHeapSize,
        totalJSHeapSize: performance.memory.totalJSHeapSize
      });
    }, 10000);
  }

  setInterval(flush, FLUSH_MS);
  window.addEventListener('pagehide', flush);
  push('monitor_initialized', { processName: cfg.processName });
})();"#;
