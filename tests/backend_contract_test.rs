//! Behaviour every backend must share, run against both engines.

mod common;

use common::{attrs, engine_msg, links, names, on_both, rev, rev_by, versions};
use wikidb::{
    Backend, Content, Error, PageData, RecentPointers, RecentQuery, SortBy, SortField, TextQuery,
    Value,
};

#[test]
fn test_version_round_trip() {
    on_both(|db| {
        let data = rev_by(1_000, "Some *wiki* text", "alice")
            .minor(true)
            .with_attr("summary", "typo");
        db.set_versiondata("Page", 1, &data).unwrap();

        let read = db.get_versiondata("Page", 1, true).unwrap().unwrap();
        assert_eq!(read, data, "{}", engine_msg(db, "full read"));

        let summary = db.get_versiondata("Page", 1, false).unwrap().unwrap();
        assert_eq!(summary.content, Content::NonEmpty);
        assert_eq!(summary.attrs, data.attrs);

        db.set_versiondata("Page", 2, &rev(2_000, "")).unwrap();
        let empty = db.get_versiondata("Page", 2, false).unwrap().unwrap();
        assert_eq!(empty.content, Content::Empty);

        assert_eq!(db.get_versiondata("Page", 9, true).unwrap(), None);
        assert_eq!(db.get_versiondata("Nowhere", 1, true).unwrap(), None);
    });
}

#[test]
fn test_rewriting_a_version_replaces_it() {
    on_both(|db| {
        db.set_versiondata("Page", 1, &rev_by(10, "first", "a")).unwrap();
        db.set_versiondata("Page", 1, &rev(20, "second")).unwrap();

        let read = db.get_versiondata("Page", 1, true).unwrap().unwrap();
        assert_eq!(read.content.text(), Some("second"));
        assert!(read.attrs.is_empty(), "{}", engine_msg(db, "attrs replaced"));
        assert_eq!(versions(db, "Page"), vec![1]);
    });
}

#[test]
fn test_out_of_order_versions() {
    on_both(|db| {
        db.set_versiondata("Page", 3, &rev(30, "three")).unwrap();
        db.set_versiondata("Page", 1, &rev(10, "one")).unwrap();

        assert_eq!(db.get_latest_version("Page").unwrap(), 3);
        assert_eq!(db.get_previous_version("Page", 3).unwrap(), 1);
        assert_eq!(db.get_previous_version("Page", 2).unwrap(), 1);
        assert_eq!(db.get_previous_version("Page", 1).unwrap(), 0);
        assert_eq!(db.get_latest_version("Nowhere").unwrap(), 0);
    });
}

#[test]
fn test_derived_indexes_follow_versions() {
    on_both(|db| {
        db.set_versiondata("Page", 1, &rev(10, "a")).unwrap();
        db.set_versiondata("Page", 2, &rev(20, "b").minor(true)).unwrap();
        db.set_versiondata("Page", 3, &rev(30, "")).unwrap();

        assert_eq!(
            db.get_recent("Page").unwrap(),
            Some(RecentPointers {
                latest_version: 3,
                latest_major: Some(3),
                latest_minor: Some(2),
            })
        );
        assert!(!db.is_wiki_page("Page").unwrap(), "{}", engine_msg(db, "deleted"));
        assert!(db.get_all_pagenames().unwrap().is_empty());

        db.delete_versiondata("Page", 3).unwrap();
        assert_eq!(
            db.get_recent("Page").unwrap(),
            Some(RecentPointers {
                latest_version: 2,
                latest_major: Some(1),
                latest_minor: Some(2),
            })
        );
        assert!(db.is_wiki_page("Page").unwrap());
        assert_eq!(db.get_all_pagenames().unwrap(), vec!["Page".to_string()]);

        // Deleting a missing version changes nothing.
        db.delete_versiondata("Page", 42).unwrap();
        db.delete_versiondata("Nowhere", 1).unwrap();
        assert!(db.check().unwrap().is_empty(), "{}", engine_msg(db, "healthy"));
    });
}

#[test]
fn test_placeholder_integrity() {
    on_both(|db| {
        db.set_versiondata("Target", 1, &rev(10, "target")).unwrap();
        db.set_versiondata("Linker", 1, &rev(10, "see Target")).unwrap();
        db.set_links("Linker", &links(&["Target"])).unwrap();
        db.update_pagedata("Target", &attrs(&[("hits", Value::Int(12)), ("owner", "bob".into())]))
            .unwrap();

        db.delete_page("Target").unwrap();

        assert!(!db.is_wiki_page("Target").unwrap());
        let placeholder = db.get_pagedata("Target").unwrap();
        assert_eq!(placeholder, Some(PageData::default()), "{}", engine_msg(db, "placeholder"));
        assert_eq!(db.get_latest_version("Target").unwrap(), 0);
        assert_eq!(names(db.get_links("Linker", false).unwrap()), vec!["Target"]);
        assert_eq!(names(db.get_links("Target", true).unwrap()), vec!["Linker"]);

        // Nothing links to Linker: its row goes away entirely.
        db.delete_page("Linker").unwrap();
        assert_eq!(db.get_pagedata("Linker").unwrap(), None);
        assert!(db.get_links("Target", true).unwrap().pagenames().is_empty());

        // A page's links to itself do not keep it around.
        db.set_versiondata("Loop", 1, &rev(10, "see Loop")).unwrap();
        db.set_links("Loop", &links(&["Loop"])).unwrap();
        db.delete_page("Loop").unwrap();
        assert_eq!(db.get_pagedata("Loop").unwrap(), None, "{}", engine_msg(db, "self link"));
    });
}

#[test]
fn test_links_create_placeholders_and_replace() {
    on_both(|db| {
        db.set_versiondata("A", 1, &rev(10, "a")).unwrap();
        db.set_links("A", &links(&["Missing", "B", "Missing", "A"])).unwrap();

        assert_eq!(names(db.get_links("A", false).unwrap()), vec!["A", "B", "Missing"]);
        assert_eq!(db.get_pagedata("Missing").unwrap(), Some(PageData::default()));
        assert!(!db.is_wiki_page("Missing").unwrap());
        assert_eq!(names(db.get_links("Missing", true).unwrap()), vec!["A"]);

        db.set_links("A", &links(&["B"])).unwrap();
        assert_eq!(names(db.get_links("A", false).unwrap()), vec!["B"]);
        assert!(names(db.get_links("Missing", true).unwrap()).is_empty());
        assert!(names(db.get_links("Nowhere", false).unwrap()).is_empty());
    });
}

#[test]
fn test_update_pagedata() {
    on_both(|db| {
        db.update_pagedata("Page", &attrs(&[("owner", "alice".into()), ("locked", true.into())]))
            .unwrap();
        let data = db.get_pagedata("Page").unwrap().unwrap();
        assert_eq!(data.get("owner"), Some(&Value::from("alice")));
        assert_eq!(data.get("locked"), Some(&Value::Bool(true)));

        db.update_pagedata("Page", &attrs(&[("locked", false.into())])).unwrap();
        db.update_pagedata("Page", &attrs(&[("hits", Value::Int(7))])).unwrap();
        let data = db.get_pagedata("Page").unwrap().unwrap();
        assert_eq!(data.get("locked"), None);
        assert_eq!(data.get("owner"), Some(&Value::from("alice")));
        assert_eq!(data.hits, 7, "{}", engine_msg(db, "hits fast path"));

        // The hits fast path never creates a row.
        db.update_pagedata("Ghost", &attrs(&[("hits", Value::Int(1))])).unwrap();
        assert_eq!(db.get_pagedata("Ghost").unwrap(), None);
    });
}

#[test]
fn test_update_versiondata() {
    on_both(|db| {
        db.set_versiondata("Page", 1, &rev_by(10, "text", "alice")).unwrap();
        db.update_versiondata(
            "Page",
            1,
            &attrs(&[
                ("summary", "fixed".into()),
                ("author", "".into()),
                ("mtime", Value::Int(99)),
                ("is_minor_edit", true.into()),
            ]),
        )
        .unwrap();

        let read = db.get_versiondata("Page", 1, true).unwrap().unwrap();
        assert_eq!(read.mtime, 99);
        assert!(read.is_minor_edit);
        assert_eq!(read.author(), None);
        assert_eq!(read.attrs.get("summary"), Some(&Value::from("fixed")));
        assert_eq!(read.content.text(), Some("text"));
        assert_eq!(db.get_recent("Page").unwrap().unwrap().latest_minor, Some(1));

        db.update_versiondata("Page", 5, &attrs(&[("summary", "x".into())])).unwrap();
        assert_eq!(db.get_versiondata("Page", 5, false).unwrap(), None);
    });
}

#[test]
fn test_lock_reentrancy() {
    on_both(|db| {
        db.lock(true).unwrap();
        db.lock(true).unwrap();
        db.unlock(false).unwrap();
        assert_eq!(db.lock_depth(), 1, "{}", engine_msg(db, "still locked"));
        db.unlock(false).unwrap();
        assert_eq!(db.lock_depth(), 0);

        db.lock(true).unwrap();
        db.lock(true).unwrap();
        db.unlock(true).unwrap();
        assert_eq!(db.lock_depth(), 0);

        db.unlock(false).unwrap();
        assert_eq!(db.lock_depth(), 0);

        // Writes inside an explicit scope are visible after it.
        db.lock(true).unwrap();
        db.set_versiondata("Page", 1, &rev(10, "x")).unwrap();
        db.set_links("Page", &links(&["Other"])).unwrap();
        db.unlock(false).unwrap();
        assert!(db.is_wiki_page("Page").unwrap());
    });
}

#[test]
fn test_foo_bar_scenario() {
    on_both(|db| {
        db.set_versiondata("Foo", 1, &rev_by(1_000, "hello", "alice")).unwrap();
        db.set_versiondata("Foo", 2, &rev_by(2_000, "hello world", "alice").minor(true))
            .unwrap();
        assert_eq!(db.get_latest_version("Foo").unwrap(), 2);
        assert!(db.is_wiki_page("Foo").unwrap());

        let id = db.rename_page("Foo", "Bar").unwrap();
        assert!(id.is_some());
        assert!(!db.is_wiki_page("Foo").unwrap());
        assert!(db.is_wiki_page("Bar").unwrap());
        let v2 = db.get_versiondata("Bar", 2, true).unwrap().unwrap();
        assert_eq!(v2.content.text(), Some("hello world"), "{}", engine_msg(db, "renamed content"));
        assert_eq!(db.get_pagedata("Foo").unwrap(), None);
    });
}

#[test]
fn test_rename_rules() {
    on_both(|db| {
        db.set_versiondata("Draft", 1, &rev(10, "draft")).unwrap();
        db.set_versiondata("Linker", 1, &rev(10, "links")).unwrap();
        db.set_links("Linker", &links(&["Target", "Draft"])).unwrap();
        db.set_versiondata("Taken", 1, &rev(10, "taken")).unwrap();

        let err = db.rename_page("Draft", "Taken").unwrap_err();
        assert!(matches!(err, Error::PageExists { .. }), "{}", engine_msg(db, "rename onto page"));
        assert!(db.is_wiki_page("Draft").unwrap());
        assert_eq!(db.lock_depth(), 0);

        assert_eq!(db.rename_page("Nowhere", "Elsewhere").unwrap(), None);

        // Target is a placeholder; the renamed page takes over its links.
        db.rename_page("Draft", "Target").unwrap().unwrap();
        assert!(db.is_wiki_page("Target").unwrap());
        assert_eq!(names(db.get_links("Linker", false).unwrap()), vec!["Target"]);
        assert_eq!(names(db.get_links("Target", true).unwrap()), vec!["Linker"]);
        assert_eq!(db.get_versiondata("Target", 1, true).unwrap().unwrap().content.text(), Some("draft"));
        assert!(db.check().unwrap().is_empty(), "{}", engine_msg(db, "healthy"));
    });
}

#[test]
fn test_invalid_arguments() {
    on_both(|db| {
        assert!(matches!(db.is_wiki_page(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            db.set_versiondata("Page", 0, &rev(10, "x")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            db.set_versiondata("Page", 1, &rev(0, "x")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(db.set_links("Page", &links(&[""])), Err(Error::InvalidArgument(_))));
        assert_eq!(db.get_pagedata("Page").unwrap(), None, "{}", engine_msg(db, "nothing written"));
    });
}

/// HomePage: hits 5, v1 major @100, v2 minor @500
/// SandBox: hits 9, v1 major @300
/// RecentChanges: hits 1, v1 major @200
/// OldPage: hits 50, v1 @50, v2 deleted @400
fn populate(db: &mut dyn Backend) {
    db.set_versiondata("HomePage", 1, &rev(100, "Welcome to the wiki")).unwrap();
    db.set_versiondata("HomePage", 2, &rev(500, "Welcome to the wiki!").minor(true)).unwrap();
    db.set_versiondata("SandBox", 1, &rev(300, "play here")).unwrap();
    db.set_versiondata("RecentChanges", 1, &rev(200, "list of changes")).unwrap();
    db.set_versiondata("OldPage", 1, &rev(50, "obsolete wiki")).unwrap();
    db.set_versiondata("OldPage", 2, &rev(400, "")).unwrap();
    for (name, hits) in [("HomePage", 5), ("SandBox", 9), ("RecentChanges", 1), ("OldPage", 50)] {
        db.update_pagedata(name, &attrs(&[("hits", Value::Int(hits))])).unwrap();
    }
}

#[test]
fn test_get_all_pages() {
    on_both(|db| {
        populate(db);

        let mut all = db.get_all_pages(false, None, None).unwrap();
        assert_eq!(all.count(), Some(3));
        let first = all.next().unwrap();
        assert_eq!(first.pagename, "HomePage");
        assert_eq!(first.pagedata.hits, 5);
        all.free();
        all.free();
        assert_eq!(all.count(), None);
        assert!(all.next().is_none());

        assert_eq!(
            names(db.get_all_pages(true, None, None).unwrap()),
            vec!["HomePage", "OldPage", "RecentChanges", "SandBox"]
        );
        assert_eq!(
            names(db.get_all_pages(false, Some("-mtime".parse().unwrap()), None).unwrap()),
            vec!["HomePage", "SandBox", "RecentChanges"],
            "{}",
            engine_msg(db, "by mtime")
        );
        assert_eq!(
            names(db.get_all_pages(false, Some(SortBy::desc(SortField::Hits)), Some(2)).unwrap()),
            vec!["SandBox", "HomePage"]
        );

        // A placeholder is a deleted page, but it has no mtime to sort by.
        db.set_links("SandBox", &links(&["Ghost"])).unwrap();
        assert_eq!(
            names(db.get_all_pages(true, None, None).unwrap()),
            vec!["Ghost", "HomePage", "OldPage", "RecentChanges", "SandBox"]
        );
        assert_eq!(
            names(db.get_all_pages(true, Some("-mtime".parse().unwrap()), None).unwrap()),
            vec!["HomePage", "OldPage", "SandBox", "RecentChanges"],
            "{}",
            engine_msg(db, "placeholders by mtime")
        );
    });
}

#[test]
fn test_text_search() {
    on_both(|db| {
        populate(db);
        let search = |db: &dyn Backend, q: &str, full: bool| names(db.text_search(&TextQuery::parse(q), full).unwrap());

        assert_eq!(search(db, "page", false), vec!["HomePage"]);
        assert_eq!(search(db, "wiki", false), Vec::<String>::new());
        assert_eq!(search(db, "wiki", true), vec!["HomePage"], "{}", engine_msg(db, "fulltext"));
        assert_eq!(search(db, "-sand", false), vec!["HomePage", "RecentChanges"]);
        assert_eq!(search(db, "h_me", false), Vec::<String>::new());

        let hit = db.text_search(&TextQuery::parse("WELCOME"), true).unwrap().next().unwrap();
        assert_eq!(hit.version, Some(2));
        assert_eq!(
            hit.versiondata.unwrap().content.text(),
            Some("Welcome to the wiki!")
        );
    });
}

#[test]
fn test_text_search_folds_ascii_case_only() {
    on_both(|db| {
        db.set_versiondata("Über", 1, &rev(10, "Über alles")).unwrap();
        db.set_versiondata("Plain", 1, &rev(10, "nothing")).unwrap();
        let search = |db: &dyn Backend, q: &str, full: bool| names(db.text_search(&TextQuery::parse(q), full).unwrap());

        assert_eq!(search(db, "Über", false), vec!["Über"]);
        assert_eq!(search(db, "ÜBER", true), vec!["Über"], "{}", engine_msg(db, "ascii fold"));
        assert_eq!(search(db, "über", false), Vec::<String>::new(), "{}", engine_msg(db, "no unicode fold"));
        assert_eq!(search(db, "über", true), Vec::<String>::new());
        assert_eq!(search(db, "-über", false), vec!["Plain", "Über"]);
    });
}

#[test]
fn test_most_popular() {
    on_both(|db| {
        populate(db);
        assert_eq!(
            names(db.most_popular(0, None).unwrap()),
            vec!["SandBox", "HomePage", "RecentChanges"],
            "{}",
            engine_msg(db, "deleted pages excluded")
        );
        assert_eq!(names(db.most_popular(-2, None).unwrap()), vec!["RecentChanges", "HomePage"]);
        assert_eq!(names(db.most_popular(1, None).unwrap()), vec!["SandBox"]);
        assert_eq!(
            names(db.most_popular(10, Some(SortBy::asc(SortField::Pagename))).unwrap()),
            vec!["HomePage", "RecentChanges", "SandBox"]
        );
    });
}

#[test]
fn test_most_recent() {
    on_both(|db| {
        populate(db);
        let recent = |db: &dyn Backend, q: RecentQuery| -> Vec<(String, u32)> {
            db.most_recent(&q)
                .unwrap()
                .into_iter()
                .map(|r| (r.pagename, r.version.unwrap()))
                .collect()
        };
        let rows = |pairs: &[(&str, u32)]| -> Vec<(String, u32)> {
            pairs.iter().map(|(n, v)| ((*n).to_string(), *v)).collect()
        };

        assert_eq!(
            recent(db, RecentQuery::new()),
            rows(&[("OldPage", 2), ("SandBox", 1), ("RecentChanges", 1), ("HomePage", 1)]),
            "{}",
            engine_msg(db, "major changes")
        );
        assert_eq!(
            recent(db, RecentQuery::new().include_minor().limit(2)),
            rows(&[("HomePage", 2), ("OldPage", 2)])
        );
        assert_eq!(recent(db, RecentQuery::new().only_minor()), rows(&[("HomePage", 2)]));
        assert_eq!(
            recent(db, RecentQuery::new().all_revisions().include_minor().since(300)),
            rows(&[("HomePage", 2), ("OldPage", 2), ("SandBox", 1)])
        );
        assert_eq!(
            recent(db, RecentQuery::new().all_revisions()),
            rows(&[("OldPage", 2), ("SandBox", 1), ("RecentChanges", 1), ("HomePage", 1), ("OldPage", 1)])
        );
        assert_eq!(
            recent(db, RecentQuery::new().limit(-2)),
            rows(&[("HomePage", 1), ("RecentChanges", 1)])
        );

        let row = db.most_recent(&RecentQuery::new().only_minor()).unwrap().next().unwrap();
        let data = row.versiondata.unwrap();
        assert_eq!(data.mtime, 500);
        assert!(data.is_minor_edit);
        assert_eq!(row.pagedata.hits, 5);
    });
}

#[test]
fn test_rebuild_indexes_is_harmless() {
    on_both(|db| {
        populate(db);
        db.rebuild_indexes().unwrap();
        assert!(db.check().unwrap().is_empty());
        assert_eq!(db.get_all_pagenames().unwrap(), vec!["HomePage", "RecentChanges", "SandBox"]);
        db.sync().unwrap();
        db.optimize().unwrap();
        assert_eq!(db.get_all_pagenames().unwrap(), vec!["HomePage", "RecentChanges", "SandBox"]);
    });
}

#[test]
fn test_close_force_unlocks() {
    on_both(|db| {
        db.lock(true).unwrap();
        db.lock(true).unwrap();
        db.close().unwrap();
        assert_eq!(db.lock_depth(), 0);
        db.close().unwrap();
    });
}
